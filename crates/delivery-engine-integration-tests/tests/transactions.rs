//! Integration tests for local transactions
//!
//! These tests verify:
//! - Transactional publishes become visible to consumers only on commit
//! - Rolled back publishes never reach the queue
//! - Transactional acknowledgements settle on commit and redeliver on rollback
//! - Persistent messages on durable queues reach the store on commit
//! - A failed store commit leaves the queue untouched

mod common;

use common::{Broker, TestConnection};
use delivery_engine::{BrokerError, ChannelId, ConsumerMode, DeliveryTag};

fn tag(value: u64) -> DeliveryTag {
    DeliveryTag::from_raw(value)
}

/// Verify that a consumer only sees transactional publishes after commit.
#[test]
fn test_commit_releases_publishes_to_consumer() {
    let broker = Broker::new();
    let queue = broker.queue("orders");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    let consumer = broker.channel(&connection, 2);
    publisher.set_local_transactional();
    consumer
        .subscribe_to_queue(None, &queue, ConsumerMode::Ack, false)
        .expect("subscribe");

    broker.publish_to(&publisher, "orders", b"a");
    broker.publish_to(&publisher, "orders", b"b");
    assert!(connection.output.deliveries().is_empty());
    assert_eq!(queue.message_count(), 0);

    publisher.commit(None).expect("commit");

    assert_eq!(connection.output.deliveries_on(ChannelId::new(2)).len(), 2);
    assert_eq!(publisher.txn_commits(), 1);
}

/// Verify that rolled back publishes are discarded.
#[test]
fn test_rollback_discards_publishes() {
    let broker = Broker::new();
    let queue = broker.queue("orders");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    publisher.set_local_transactional();

    broker.publish_to(&publisher, "orders", b"a");
    publisher.rollback().expect("rollback");
    publisher.commit(None).expect("empty commit");

    assert_eq!(queue.message_count(), 0);
    assert_eq!(publisher.txn_rejects(), 1);
}

/// Verify that a transactional acknowledgement settles on commit.
#[test]
fn test_transactional_ack_commit() {
    let broker = Broker::new();
    let queue = broker.queue("orders");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    let consumer = broker.channel(&connection, 2);
    consumer.set_local_transactional();
    consumer
        .subscribe_to_queue(None, &queue, ConsumerMode::Ack, false)
        .expect("subscribe");
    broker.publish_to(&publisher, "orders", b"a");

    consumer.acknowledge_message(tag(1), false).expect("ack");
    assert_eq!(queue.message_count(), 1);

    consumer.commit(None).expect("commit");
    assert_eq!(queue.message_count(), 0);
    assert_eq!(consumer.unacknowledged_message_count(), 0);
}

/// Verify that rolling back an acknowledgement redelivers the message under
/// a new delivery tag.
#[test]
fn test_transactional_ack_rollback_redelivers() {
    let broker = Broker::new();
    let queue = broker.queue("orders");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    let consumer = broker.channel(&connection, 2);
    consumer.set_local_transactional();
    consumer
        .subscribe_to_queue(None, &queue, ConsumerMode::Ack, false)
        .expect("subscribe");
    broker.publish_to(&publisher, "orders", b"a");
    consumer.acknowledge_message(tag(1), false).expect("ack");

    consumer.rollback().expect("rollback");

    let deliveries = connection.output.deliveries_on(ChannelId::new(2));
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].delivery_tag, tag(2));
    assert_eq!(consumer.unacknowledged_tags(), vec![tag(2)]);
    assert_eq!(queue.message_count(), 1);
}

/// Verify that committed persistent messages on a durable queue are recorded
/// by the store.
#[test]
fn test_durable_commit_reaches_store() {
    let broker = Broker::new();
    let queue = broker.durable_queue("ledger");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    publisher.set_local_transactional();

    broker.publish_persistent(&publisher, "ledger", b"entry-1");
    broker.publish_persistent(&publisher, "ledger", b"entry-2");
    assert!(broker.store.durable_messages(queue.name()).is_empty());

    publisher.commit(None).expect("commit");

    assert_eq!(queue.message_count(), 2);
    assert_eq!(broker.store.durable_messages(queue.name()).len(), 2);
}

/// Verify that a store failure during commit is reported and nothing is
/// enqueued.
#[test]
fn test_failed_store_commit() {
    let broker = Broker::new();
    let queue = broker.durable_queue("ledger");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    publisher.set_local_transactional();
    broker.publish_persistent(&publisher, "ledger", b"entry");
    broker.store.set_fail_commits(true);

    let result = publisher.commit(None);

    assert!(matches!(result, Err(BrokerError::Store(_))));
    assert_eq!(queue.message_count(), 0);
}

/// Verify that deferred store completion is picked up by sync.
#[test]
fn test_async_commit_completes_on_sync() {
    let broker = Broker::new();
    let queue = broker.durable_queue("ledger");
    let connection = TestConnection::new();
    let publisher = broker.channel(&connection, 1);
    publisher.set_local_transactional();
    broker.publish_persistent(&publisher, "ledger", b"entry");
    broker.store.set_defer_commits(true);

    publisher.commit_async(None).expect("commit async");
    assert_eq!(publisher.pending_command_count(), 1);
    assert_eq!(queue.message_count(), 0);

    assert_eq!(broker.store.complete_pending(Ok(())), 1);
    publisher.sync().expect("sync");

    assert_eq!(publisher.pending_command_count(), 0);
    assert_eq!(queue.message_count(), 1);
}
