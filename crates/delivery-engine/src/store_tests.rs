//! Tests for the in-memory message store.

use super::*;
use crate::message::{ContentHeader, PublishInfo, Timestamp};

fn metadata(size: u64) -> MessageMetaData {
    MessageMetaData {
        publish_info: PublishInfo::new("amq.direct", Some("key")),
        header: ContentHeader::new(size),
        arrival_time: Timestamp::now(),
    }
}

fn queue_name() -> QueueName {
    QueueName::new("durable").unwrap()
}

/// Verify that stored messages get increasing numbers and keep their content.
#[test]
fn test_add_message_and_content() {
    let store = InMemoryMessageStore::new();
    let first = store.add_message(&metadata(5)).unwrap();
    let second = store.add_message(&metadata(0)).unwrap();

    first.add_content(0, b"hel").unwrap();
    first.add_content(3, b"lo").unwrap();

    assert!(second.message_number() > first.message_number());
    assert_eq!(first.content(), Bytes::from_static(b"hello"));
    assert_eq!(store.message_count(), 2);

    first.remove();
    assert_eq!(store.message_count(), 1);
}

/// Verify that a committed transaction records durable enqueues and dequeues.
#[test]
fn test_transaction_commit_applies() {
    let store = InMemoryMessageStore::new();
    let mut txn = store.begin_transaction();
    txn.enqueue_message(&queue_name(), 1).unwrap();
    txn.enqueue_message(&queue_name(), 2).unwrap();
    txn.commit_async().wait_for_completion().unwrap();

    assert_eq!(store.durable_messages(&queue_name()), vec![1, 2]);

    let mut txn = store.begin_transaction();
    txn.dequeue_message(&queue_name(), 1).unwrap();
    txn.commit_async().wait_for_completion().unwrap();

    assert_eq!(store.durable_messages(&queue_name()), vec![2]);
}

/// Verify that an aborted transaction leaves no trace.
#[test]
fn test_transaction_abort() {
    let store = InMemoryMessageStore::new();
    let mut txn = store.begin_transaction();
    txn.enqueue_message(&queue_name(), 1).unwrap();
    txn.abort();

    assert!(store.durable_messages(&queue_name()).is_empty());
}

/// Verify that failing commits report an error and are never complete.
#[test]
fn test_failed_commit() {
    let store = InMemoryMessageStore::new();
    store.set_fail_commits(true);

    let mut txn = store.begin_transaction();
    txn.enqueue_message(&queue_name(), 1).unwrap();
    let future = txn.commit_async();

    assert!(!future.is_complete());
    assert!(matches!(
        future.wait_for_completion(),
        Err(StoreError::CommitFailed { .. })
    ));
    assert!(store.durable_messages(&queue_name()).is_empty());
}

/// Verify that failing records are refused before anything is committed.
#[test]
fn test_failed_records() {
    let store = InMemoryMessageStore::new();
    store.set_fail_records(true);

    let mut txn = store.begin_transaction();

    assert!(matches!(txn.enqueue_message(&queue_name(), 1), Err(StoreError::Io { .. })));
    assert!(matches!(txn.dequeue_message(&queue_name(), 1), Err(StoreError::Io { .. })));
    assert!(txn.commit_async().wait_for_completion().is_ok());
    assert!(store.durable_messages(&queue_name()).is_empty());
}

/// Verify that deferred commits complete only when released.
#[test]
fn test_deferred_commit() {
    let store = InMemoryMessageStore::new();
    store.set_defer_commits(true);

    let mut txn = store.begin_transaction();
    txn.enqueue_message(&queue_name(), 9).unwrap();
    let future = txn.commit_async();

    assert!(!future.is_complete());
    assert!(store.durable_messages(&queue_name()).is_empty());

    assert_eq!(store.complete_pending(Ok(())), 1);
    assert!(future.is_complete());
    assert!(future.wait_for_completion().is_ok());
    assert_eq!(store.durable_messages(&queue_name()), vec![9]);
}

/// Verify that a deferred future wakes a waiting thread.
#[test]
fn test_deferred_future_wakes_waiter() {
    let (future, completion) = DeferredStoreFuture::new();
    let waiter = std::thread::spawn(move || future.wait_for_completion());

    completion.complete(Ok(()));
    assert!(waiter.join().unwrap().is_ok());
}

/// Verify that dropping an unfired completion abandons the future.
#[test]
fn test_dropped_completion_abandons() {
    let (future, completion) = DeferredStoreFuture::new();
    drop(completion);

    assert_eq!(future.wait_for_completion(), Err(StoreError::Abandoned));
    assert!(!future.is_complete());
}

/// Verify the resolved future helpers.
#[test]
fn test_immediate_futures() {
    assert!(ImmediateStoreFuture::ok().is_complete());
    let failed = ImmediateStoreFuture::failed(StoreError::Io {
        message: "boom".to_string(),
    });
    assert!(!failed.is_complete());
    assert!(failed.wait_for_completion().is_err());
}
