// src/core/tasks/timeout_sweeper.rs

use crate::core::multiplexer::RequestTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// A task that periodically expires pending requests whose deadline has
/// passed, independently of the read loop. It catches requests whose caller
/// is not currently polling its handle, e.g. an iterator nobody is draining.
pub struct TimeoutSweeperTask {
    table: Arc<RequestTable>,
    interval: Duration,
}

impl TimeoutSweeperTask {
    /// Creates a new `TimeoutSweeperTask`.
    pub fn new(table: Arc<RequestTable>, interval: Duration) -> Self {
        Self { table, interval }
    }

    /// Runs the sweep loop until a shutdown signal is received.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Timeout sweeper started. Interval: {:?}", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.table.expire(Instant::now());
                    if expired > 0 {
                        info!("Timeout sweeper expired {} pending requests.", expired);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Timeout sweeper shutting down.");
                    return;
                }
            }
        }
    }
}
