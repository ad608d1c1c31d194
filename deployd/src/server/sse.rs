//! Server-sent event framing for deployment logs
//!
//! Each [`LogEvent`] becomes one SSE message: `id` carries the sequence
//! number and `data` the text. Frames are untyped by default so that plain
//! `onmessage` listeners receive them; the kind is recoverable from the text
//! markers. Typed framing adds `event: <kind>` for clients that ask for it.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};

use crate::deploy::broadcaster::Subscription;
use crate::models::event::LogEvent;

/// Interval between keep-alive comments on an idle stream
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Header a reconnecting client uses to resume after an event it has seen
pub const LAST_EVENT_ID: &str = "last-event-id";

/// How log events are framed on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// `id` and `data` only
    #[default]
    Untyped,
    /// Adds `event: <kind>`
    Typed,
}

impl Framing {
    pub fn from_flag(typed: bool) -> Self {
        if typed {
            Framing::Typed
        } else {
            Framing::Untyped
        }
    }
}

/// Build the SSE message for one log event
pub fn to_sse_event(event: &LogEvent, framing: Framing) -> Event {
    // Carriage returns cannot be framed; progress bars use them heavily
    let data = event.text.replace("\r\n", "\n").replace('\r', "\n");
    let frame = Event::default().id(event.sequence.to_string());
    let frame = match framing {
        Framing::Untyped => frame,
        Framing::Typed => frame.event(event.kind.as_str()),
    };
    frame.data(data)
}

/// Sequence number from a `Last-Event-ID` header, if present and valid
pub fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Stream a subscription to the client
///
/// The stream ends once the deployment's log is closed and drained. Dropping
/// the response (client went away) drops the subscription, which detaches
/// it without touching the deployment.
pub fn stream(
    subscription: Subscription,
    framing: Framing,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let events = subscription
        .into_stream()
        .map(move |event| Ok::<_, Infallible>(to_sse_event(&event, framing)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
