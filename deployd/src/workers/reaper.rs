//! Eviction worker for finished deployments

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::deploy::registry::Registry;

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often to look for expired deployments
    pub interval: Duration,

    /// How long a finished deployment stays queryable
    pub retention: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        }
    }
}

/// Run the reaper worker
pub async fn run<S, F>(
    options: &Options,
    registry: &Registry,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reaper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let evicted = registry.evict_expired(options.retention, Utc::now());
        debug!(
            "Reaper pass evicted {} deployments, {} remain",
            evicted,
            registry.len()
        );
    }
}
