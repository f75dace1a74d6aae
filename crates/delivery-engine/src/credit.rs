//! Prefetch credit shared by the consumers of a channel.
//!
//! Credit is bounded by a message count and a byte count; zero disables a
//! bound. A message larger than the whole byte window is still let through
//! when nothing else is outstanding, otherwise such a message could never be
//! delivered.

use parking_lot::Mutex;
use tracing::debug;

#[cfg(test)]
#[path = "credit_tests.rs"]
mod tests;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CreditState {
    count_limit: u32,
    bytes_limit: u64,
    count_used: u32,
    bytes_used: u64,
}

impl CreditState {
    fn has_credit(&self) -> bool {
        (self.count_limit == 0 || self.count_used < self.count_limit)
            && (self.bytes_limit == 0 || self.bytes_used < self.bytes_limit)
    }
}

/// Credit manager for prefetch-limited delivery
#[derive(Debug, Default)]
pub struct CreditManager {
    state: Mutex<CreditState>,
}

impl CreditManager {
    /// Create a manager with a byte window and a message window
    pub fn new(prefetch_size: u64, prefetch_count: u32) -> Self {
        Self {
            state: Mutex::new(CreditState {
                count_limit: prefetch_count,
                bytes_limit: prefetch_size,
                ..CreditState::default()
            }),
        }
    }

    /// Replace both limits. Returns true when credit became available that
    /// was not available before.
    pub fn set_credit_limits(&self, prefetch_size: u64, prefetch_count: u32) -> bool {
        let mut state = self.state.lock();
        let had_credit = state.has_credit();
        state.bytes_limit = prefetch_size;
        state.count_limit = prefetch_count;
        debug!(prefetch_size, prefetch_count, "Credit limits changed");
        !had_credit && state.has_credit()
    }

    /// Take credit for one message of `size` bytes
    pub fn allocate(&self, size: u64) -> bool {
        let mut state = self.state.lock();

        if state.count_limit != 0 && state.count_used >= state.count_limit {
            return false;
        }

        if state.bytes_limit != 0 {
            let fits = state.bytes_used + size <= state.bytes_limit;
            if !fits && state.bytes_used != 0 {
                return false;
            }
        }

        state.count_used += 1;
        state.bytes_used += size;
        true
    }

    /// Give back credit for `count` messages totalling `size` bytes
    pub fn restore(&self, count: u32, size: u64) {
        let mut state = self.state.lock();
        state.count_used = state.count_used.saturating_sub(count);
        state.bytes_used = state.bytes_used.saturating_sub(size);
    }

    /// Whether another delivery fits within both limits
    pub fn has_credit(&self) -> bool {
        self.state.lock().has_credit()
    }

    /// Whether either window is bounded
    pub fn is_limited(&self) -> bool {
        let state = self.state.lock();
        state.count_limit != 0 || state.bytes_limit != 0
    }

    /// Deliveries counted against the prefetch count
    pub fn messages_outstanding(&self) -> u32 {
        self.state.lock().count_used
    }

    pub fn bytes_outstanding(&self) -> u64 {
        self.state.lock().bytes_used
    }

    pub fn prefetch_count(&self) -> u32 {
        self.state.lock().count_limit
    }

    pub fn prefetch_size(&self) -> u64 {
        self.state.lock().bytes_limit
    }
}
