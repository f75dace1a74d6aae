//! Tests for transaction timeouts.

use super::*;
use crate::store::InMemoryMessageStore;
use crate::transaction::{action, ActivityClock, AutoCommitTransaction, LocalTransaction};
use parking_lot::Mutex;
use std::sync::Arc;

fn at(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis).unwrap()
}

/// Local transaction whose first work happened at `start` and last at `update`
fn transaction(start: i64, update: i64) -> LocalTransaction {
    let now = Arc::new(Mutex::new(at(start)));
    let source = Arc::clone(&now);
    let clock: ActivityClock = Arc::new(move || *source.lock());
    let mut txn =
        LocalTransaction::with_activity_clock(Arc::new(InMemoryMessageStore::new()), clock);
    txn.add_post_transaction_action(action(|| Ok(()), || {})).unwrap();
    *now.lock() = at(update);
    txn.add_post_transaction_action(action(|| Ok(()), || {})).unwrap();
    txn
}

fn timeouts(open_close: u64, idle_close: u64) -> TransactionTimeouts {
    TransactionTimeouts {
        open_warn: 0,
        open_close,
        idle_warn: 0,
        idle_close,
    }
}

/// Verify that disabled thresholds never close.
#[test]
fn test_disabled() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let txn = transaction(0, 0);
    assert!(!TransactionTimeouts::default().is_enabled());
    assert!(helper.check(&txn, &TransactionTimeouts::default(), at(1_000_000)).is_none());
}

/// Verify that an idle transaction is closed.
#[test]
fn test_idle_close() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let txn = transaction(1_000, 2_000);

    assert!(helper.check(&txn, &timeouts(0, 500), at(2_400)).is_none());
    assert_eq!(
        helper.check(&txn, &timeouts(0, 500), at(2_600)).as_deref(),
        Some("Idle transaction timed out")
    );
}

/// Verify that a long open transaction is closed.
#[test]
fn test_open_close() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let txn = transaction(1_000, 5_000);

    assert_eq!(
        helper.check(&txn, &timeouts(3_000, 0), at(5_000)).as_deref(),
        Some("Open transaction timed out")
    );
}

/// Verify that the idle check wins when both thresholds are exceeded.
#[test]
fn test_idle_checked_first() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let txn = transaction(0, 100);

    assert_eq!(
        helper.check(&txn, &timeouts(50, 50), at(10_000)).as_deref(),
        Some("Idle transaction timed out")
    );
}

/// Verify that warnings alone never close.
#[test]
fn test_warn_only() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let txn = transaction(0, 0);
    let warn_only = TransactionTimeouts {
        open_warn: 10,
        idle_warn: 10,
        ..TransactionTimeouts::default()
    };

    assert!(warn_only.is_enabled());
    assert!(helper.check(&txn, &warn_only, at(60_000)).is_none());
}

/// Verify that transactions with no work, finished ones and auto-commit are skipped.
#[test]
fn test_skipped_transactions() {
    let helper = TransactionTimeoutHelper::new("channel 1");
    let limits = timeouts(1, 1);

    let empty = LocalTransaction::new(Arc::new(InMemoryMessageStore::new()));
    assert!(helper.check(&empty, &limits, at(i64::from(i32::MAX))).is_none());

    let mut committed = transaction(0, 0);
    committed.commit(None).unwrap();
    assert!(helper.check(&committed, &limits, at(60_000)).is_none());

    let auto = AutoCommitTransaction::new(Arc::new(InMemoryMessageStore::new()));
    assert!(helper.check(&auto, &limits, at(60_000)).is_none());
}
