//! Open and idle time limits for local transactions.
//!
//! A transaction that stays open, or sits idle between two pieces of work,
//! for longer than its warning threshold is logged; past the close
//! threshold the owning connection is closed. The idle check runs first and
//! a close decided by it skips the open check.

use crate::message::Timestamp;
use crate::transaction::{ServerTransaction, TransactionState};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[cfg(test)]
#[path = "timeout_tests.rs"]
mod tests;

/// Thresholds in milliseconds. Zero disables a threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTimeouts {
    pub open_warn: u64,
    pub open_close: u64,
    pub idle_warn: u64,
    pub idle_close: u64,
}

impl TransactionTimeouts {
    pub fn is_enabled(&self) -> bool {
        self.open_warn != 0 || self.open_close != 0 || self.idle_warn != 0 || self.idle_close != 0
    }
}

fn is_timed_out(elapsed: i64, threshold: u64) -> bool {
    threshold > 0 && elapsed > 0 && elapsed as u64 > threshold
}

/// Evaluates one transaction against [`TransactionTimeouts`]
#[derive(Debug, Clone)]
pub struct TransactionTimeoutHelper {
    subject: String,
}

impl TransactionTimeoutHelper {
    /// `subject` names the owner in log events, e.g. a channel
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into() }
    }

    /// Log exceeded warning thresholds and return the close reason if a
    /// close threshold was exceeded.
    pub fn check(
        &self,
        transaction: &dyn ServerTransaction,
        timeouts: &TransactionTimeouts,
        now: Timestamp,
    ) -> Option<String> {
        if !transaction.is_transactional() || transaction.state() != TransactionState::Active {
            return None;
        }

        if let Some(update_time) = transaction.update_time() {
            let idle = update_time.millis_until(&now);
            if is_timed_out(idle, timeouts.idle_warn) {
                warn!(subject = %self.subject, idle_ms = idle, "Idle Transaction");
            }
            if is_timed_out(idle, timeouts.idle_close) {
                return Some("Idle transaction timed out".to_string());
            }
        }

        if let Some(start_time) = transaction.start_time() {
            let open = start_time.millis_until(&now);
            if is_timed_out(open, timeouts.open_warn) {
                warn!(subject = %self.subject, open_ms = open, "Open Transaction");
            }
            if is_timed_out(open, timeouts.open_close) {
                return Some("Open transaction timed out".to_string());
            }
        }

        None
    }
}
