//! Per-deployment event log with live fan-out
//!
//! Every event is appended to a bounded buffer and pushed to the live
//! subscribers through a `tokio::sync::broadcast` channel. Appending and
//! subscribing take the same lock, so the replay snapshot handed to a new
//! subscriber and the first event it receives live never overlap or leave a
//! gap.
//!
//! A subscriber that falls more than its channel capacity behind is told by
//! the channel that it lagged; it then re-reads what it missed from the
//! retained buffer. Only events already evicted from the buffer are lost, and
//! the publisher never waits on a subscriber.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::event::{LogEvent, LogKind};

/// Buffer limits for an event log
#[derive(Debug, Clone, Copy)]
pub struct EventLogLimits {
    /// Events retained for replay; oldest evicted first
    pub retained: usize,

    /// Events a live subscriber may fall behind before it has to resync
    pub per_subscriber: usize,
}

impl Default for EventLogLimits {
    fn default() -> Self {
        Self {
            retained: 5_000,
            per_subscriber: 1_024,
        }
    }
}

struct Inner {
    buffer: VecDeque<LogEvent>,
    next_sequence: u64,
    sender: Option<broadcast::Sender<LogEvent>>,
    subscribers: HashSet<u64>,
    next_subscriber_id: u64,
}

/// Ordered, bounded, append-only event log of one deployment
pub struct EventLog {
    inner: Mutex<Inner>,
    limits: EventLogLimits,
}

impl EventLog {
    pub fn new(limits: EventLogLimits) -> Self {
        let limits = EventLogLimits {
            retained: limits.retained.max(1),
            per_subscriber: limits.per_subscriber.max(1),
        };
        let (sender, _) = broadcast::channel(limits.per_subscriber);
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                next_sequence: 0,
                sender: Some(sender),
                subscribers: HashSet::new(),
                next_subscriber_id: 0,
            }),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and push it to every attached subscriber
    ///
    /// Events published after [`close`](Self::close) are dropped.
    pub fn publish(&self, kind: LogKind, text: impl Into<String>) -> Option<LogEvent> {
        let mut inner = self.lock();
        let sender = inner.sender.clone()?;

        let event = LogEvent {
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            kind,
            text: text.into(),
        };
        inner.next_sequence += 1;

        inner.buffer.push_back(event.clone());
        while inner.buffer.len() > self.limits.retained {
            inner.buffer.pop_front();
        }

        // No receivers is not an error
        let _ = sender.send(event.clone());
        Some(event)
    }

    /// Stop accepting events; live subscribers end after draining
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.sender.take().is_some() {
            debug!("Event log closed at sequence {}", inner.next_sequence);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    /// Attach a subscriber, replaying retained events with sequence above `after`
    pub fn subscribe(self: &Arc<Self>, after: Option<u64>) -> Subscription {
        let mut inner = self.lock();
        let replay: VecDeque<LogEvent> = inner
            .buffer
            .iter()
            .filter(|e| after.map_or(true, |seq| e.sequence > seq))
            .cloned()
            .collect();
        let receiver = inner.sender.as_ref().map(|tx| tx.subscribe());

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id);

        Subscription {
            log: self.clone(),
            id,
            replay_len: replay.len(),
            replay,
            receiver,
            last_sequence: after,
        }
    }

    fn detach(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Copy of the retained events
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lock().buffer.iter().cloned().collect()
    }

    /// Sequence of the most recent event, if any was published
    pub fn last_sequence(&self) -> Option<u64> {
        self.lock().next_sequence.checked_sub(1)
    }

    fn retained_after(&self, after: Option<u64>) -> VecDeque<LogEvent> {
        self.lock()
            .buffer
            .iter()
            .filter(|e| after.map_or(true, |seq| e.sequence > seq))
            .cloned()
            .collect()
    }
}

/// A live, attached reader of an [`EventLog`]
///
/// Yields the replay snapshot first, then live events, each strictly after
/// the previous one. Dropping it detaches from the log.
pub struct Subscription {
    log: Arc<EventLog>,
    id: u64,
    replay_len: usize,
    replay: VecDeque<LogEvent>,
    receiver: Option<broadcast::Receiver<LogEvent>>,
    last_sequence: Option<u64>,
}

impl Subscription {
    /// Number of events that were replayed from history at attach time
    pub fn replay_len(&self) -> usize {
        self.replay_len
    }

    /// Whether the log was still open when this subscription attached
    pub fn is_live(&self) -> bool {
        self.receiver.is_some()
    }

    fn accept(&mut self, event: LogEvent) -> Option<LogEvent> {
        if self.last_sequence.is_some_and(|seq| event.sequence <= seq) {
            return None;
        }
        self.last_sequence = Some(event.sequence);
        Some(event)
    }

    /// Next event, or `None` once the log is closed and drained
    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            while let Some(event) = self.replay.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        "Subscriber {} lagged by {} events, resyncing from buffer",
                        self.id, skipped
                    );
                    self.replay = self.log.retained_after(self.last_sequence);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Turn the subscription into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = LogEvent> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.log.detach(self.id);
    }
}
