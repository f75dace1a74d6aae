//! Drain barrier between channel state changes and in-flight deliveries.
//!
//! A state change (suspend, block, commit, rollback, close) bumps the
//! generation and then passes through the send lock of every subscription
//! on the channel. Once [`QuiesceBarrier::drain`] returns, any delivery that
//! was already past its state check has finished, and every later delivery
//! sees the new generation. A delivery compares the generation it
//! snapshotted before starting with the current one right before sending;
//! a mismatch means "state changed, check again".

use crate::subscription::Subscription;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(test)]
#[path = "quiesce_tests.rs"]
mod tests;

/// Snapshot of a barrier's generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct QuiesceBarrier {
    generation: AtomicU64,
}

impl QuiesceBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, snapshot: Generation) -> bool {
        self.snapshot() == snapshot
    }

    /// Advance the generation, returning the new one
    pub fn bump(&self) -> Generation {
        Generation(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Bump the generation and wait until no delivery that started under
    /// the previous one is still running on any of `subscriptions`.
    pub fn drain<'a>(
        &self,
        subscriptions: impl IntoIterator<Item = &'a Arc<Subscription>>,
    ) -> Generation {
        let generation = self.bump();
        for subscription in subscriptions {
            drop(subscription.send_lock());
        }
        generation
    }
}
