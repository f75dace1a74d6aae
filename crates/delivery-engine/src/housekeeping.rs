//! Periodic transaction timeout checks across channels.

use crate::channel::Channel;
use crate::timeout::TransactionTimeouts;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[cfg(test)]
#[path = "housekeeping_tests.rs"]
mod tests;

/// Channels watched for open and idle transactions
#[derive(Debug, Default)]
pub struct ChannelMonitor {
    channels: Mutex<Vec<Weak<Channel>>>,
}

impl ChannelMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `channel` for periodic transaction timeout checks
    pub fn register(&self, channel: &Arc<Channel>) {
        self.channels.lock().push(Arc::downgrade(channel));
    }

    /// Live channels currently watched
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Check every live channel once. Dropped and closed channels are
    /// forgotten. Returns the number of connections closed.
    pub fn check_all(&self, timeouts: &TransactionTimeouts) -> usize {
        let channels: Vec<Arc<Channel>> = {
            let mut channels = self.channels.lock();
            channels.retain(|weak| weak.upgrade().is_some_and(|channel| !channel.is_closing()));
            channels.iter().filter_map(Weak::upgrade).collect()
        };

        let closed = channels
            .iter()
            .filter(|channel| channel.check_transaction_status(timeouts))
            .count();

        if closed > 0 {
            info!(closed, "Closed connections with timed out transactions");
        }
        closed
    }

    /// Run [`ChannelMonitor::check_all`] every `interval` until the task is
    /// aborted
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        timeouts: TransactionTimeouts,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(interval_ms = interval.as_millis() as u64, "Transaction housekeeping started");

            loop {
                ticker.tick().await;
                if timeouts.is_enabled() {
                    monitor.check_all(&timeouts);
                }
            }
        })
    }
}
