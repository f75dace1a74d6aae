//! Tests for message instances and their state machine.

use super::*;
use crate::collaborators::BindingRouter;
use crate::message::QueueName;
use crate::test_support::{consume, memory_store, message, message_with, queue};

fn enqueued(name: &str) -> (Arc<Queue>, Arc<MessageInstance>) {
    let store = memory_store();
    let q = queue(name, &store);
    let msg = message(&store, "key", b"payload");
    let instance = q.enqueue(msg, InstanceProperties::default(), None);
    (q, instance)
}

mod transition_tests {
    use super::*;

    /// Verify that a new instance is available.
    #[test]
    fn test_new_instance_is_available() {
        let (_q, instance) = enqueued("fresh");
        assert!(instance.is_available());
        assert_eq!(instance.delivery_count(), 0);
        assert!(!instance.is_redelivered());
    }

    /// Verify that only one of two acquirers wins.
    #[test]
    fn test_acquire_is_exclusive() {
        let (_q, instance) = enqueued("exclusive");
        assert!(instance.acquire(None));
        assert!(!instance.acquire(None));
        assert!(instance.is_acquired());
        assert!(!instance.acquired_by_subscription());
    }

    /// Verify that concurrent acquirers produce exactly one winner.
    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (_q, instance) = enqueued("race");
        let winners: usize = (0..8)
            .map(|_| {
                let instance = Arc::clone(&instance);
                std::thread::spawn(move || instance.acquire(None))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
    }

    /// Verify that release returns an acquired instance to available.
    #[test]
    fn test_release_after_acquire() {
        let (_q, instance) = enqueued("release");
        assert!(!instance.release());
        assert!(instance.acquire(None));
        instance.increment_delivery_count();

        assert!(instance.release());
        assert!(instance.is_available());
        assert_eq!(instance.delivery_count(), 1);
    }

    /// Verify that delete is terminal and idempotent.
    #[test]
    fn test_delete_is_terminal() {
        let (q, instance) = enqueued("delete");
        assert_eq!(q.message_count(), 1);
        assert!(instance.acquire(None));

        assert!(instance.delete());
        assert!(!instance.delete());
        assert!(instance.is_deleted());
        assert!(!instance.acquire(None));
        assert!(!instance.release());
        assert_eq!(q.message_count(), 0);
    }

    /// Verify that dequeue is terminal.
    #[test]
    fn test_dequeue_is_terminal() {
        let (q, instance) = enqueued("dequeue");
        assert!(instance.dequeue());
        assert_eq!(instance.state_kind(), StateKind::Dequeued);
        assert!(!instance.delete());
        assert_eq!(q.message_count(), 0);
    }

    /// Verify that the acquiring subscription is remembered.
    #[test]
    fn test_acquired_by_subscription() {
        let (q, instance) = enqueued("by-sub");
        let (_target, subscription) = consume(&q, "c1");
        q.attempt_delivery(&subscription);

        assert!(instance.is_acquired_by(subscription.id()));
        assert!(instance.acquired_by_subscription());
        assert_eq!(instance.delivered_subscription().unwrap().id(), subscription.id());
        assert_eq!(
            format!("{:?}", instance.state()),
            format!("{{ACQUIRED : {}}}", subscription.id())
        );
    }
}

mod listener_tests {
    use super::*;
    use parking_lot::Mutex;

    /// Verify that listeners observe every transition once.
    #[test]
    fn test_listener_sees_transitions() {
        let (_q, instance) = enqueued("listen");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let listener: Arc<dyn StateChangeListener> =
            Arc::new(move |_: &MessageInstance, old: StateKind, new: StateKind| {
                recorder.lock().push((old, new))
            });
        instance.add_state_change_listener(Arc::clone(&listener));

        instance.acquire(None);
        instance.release();
        instance.acquire(None);
        instance.delete();
        instance.delete();

        assert_eq!(
            *seen.lock(),
            vec![
                (StateKind::Available, StateKind::Acquired),
                (StateKind::Acquired, StateKind::Available),
                (StateKind::Available, StateKind::Acquired),
                (StateKind::Acquired, StateKind::Deleted),
            ]
        );

        assert!(instance.remove_state_change_listener(&listener));
        assert!(!instance.remove_state_change_listener(&listener));
    }
}

mod bookkeeping_tests {
    use super::*;

    /// Verify that the delivery count never drops below zero.
    #[test]
    fn test_delivery_count_floor() {
        let (_q, instance) = enqueued("count");
        instance.decrement_delivery_count();
        assert_eq!(instance.delivery_count(), 0);

        instance.increment_delivery_count();
        instance.increment_delivery_count();
        instance.decrement_delivery_count();
        assert_eq!(instance.delivery_count(), 1);
    }

    /// Verify that rejection is recorded per subscription.
    #[test]
    fn test_reject_per_subscription() {
        let (_q, instance) = enqueued("reject");
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();

        instance.reject(a);
        assert!(instance.is_rejected_by(a));
        assert!(!instance.is_rejected_by(b));
    }

    /// Verify that the maximum delivery count comes from the owning queue.
    #[test]
    fn test_maximum_delivery_count_from_queue() {
        let store = memory_store();
        let q = Queue::builder(QueueName::new("limited").unwrap(), store.clone())
            .maximum_delivery_count(3)
            .build()
            .unwrap();
        let instance = q.enqueue(message(&store, "key", b"x"), InstanceProperties::default(), None);

        assert_eq!(instance.maximum_delivery_count(), 3);
        drop(q);
        assert_eq!(instance.maximum_delivery_count(), 0);
    }

    /// Verify expiry against the captured expiration.
    #[test]
    fn test_expired() {
        let store = memory_store();
        let q = queue("ttl", &store);
        let past = Timestamp::now().add_millis(-1_000);
        let msg = message_with(
            &store,
            crate::message::PublishInfo::new("amq.direct", Some("key")),
            crate::message::ContentHeader::new(1).with_expiration(past),
            b"x",
        );
        let properties = InstanceProperties::for_publish(&msg);
        let instance =
            MessageInstance::new(EntryId::from_raw(1), msg, Arc::downgrade(&q), properties);

        assert!(instance.expired());
        let (_q, fresh) = enqueued("no-ttl");
        assert!(!fresh.expired());
    }
}

mod alternate_tests {
    use super::*;

    /// Verify that routing to the alternate exchange moves the message.
    #[test]
    fn test_route_to_alternate() {
        let store = memory_store();
        let dead_letters = queue("dlq", &store);
        let router = Arc::new(BindingRouter::new("dlx"));
        router.bind("key", Arc::clone(&dead_letters));

        let source = Queue::builder(QueueName::new("source").unwrap(), store.clone())
            .alternate_exchange(router)
            .build()
            .unwrap();
        let instance =
            source.enqueue(message(&store, "key", b"x"), InstanceProperties::default(), None);
        instance.acquire(None);

        let routed = instance.route_to_alternate(None, None).unwrap();

        assert_eq!(routed, 1);
        assert_eq!(instance.state_kind(), StateKind::Dequeued);
        assert_eq!(source.message_count(), 0);
        assert_eq!(dead_letters.message_count(), 1);
    }

    /// Verify that without an alternate exchange the message is only dequeued.
    #[test]
    fn test_route_without_alternate() {
        let (q, instance) = enqueued("no-alternate");
        instance.acquire(None);

        let routed = instance.route_to_alternate(None, None).unwrap();

        assert_eq!(routed, 0);
        assert!(instance.is_dispensed());
        assert_eq!(q.message_count(), 0);
    }

    /// Verify that a redelivered flag is carried to the rerouted copy.
    #[test]
    fn test_route_carries_redelivered() {
        let store = memory_store();
        let dead_letters = queue("dlq-flag", &store);
        let router = Arc::new(BindingRouter::new("dlx"));
        router.bind("key", Arc::clone(&dead_letters));
        let source = Queue::builder(QueueName::new("source-flag").unwrap(), store.clone())
            .alternate_exchange(router)
            .build()
            .unwrap();
        let instance =
            source.enqueue(message(&store, "key", b"x"), InstanceProperties::default(), None);
        instance.set_redelivered();

        instance.route_to_alternate(None, None).unwrap();

        let rerouted = dead_letters.entries().iter().next().unwrap();
        assert!(rerouted.is_redelivered());
    }

    /// Router that registers work with the transaction and then fails
    struct FailingRouter {
        rollbacks: Arc<AtomicU32>,
    }

    impl crate::collaborators::Router for FailingRouter {
        fn name(&self) -> &str {
            "broken"
        }

        fn send(
            &self,
            _message: &Arc<ServerMessage>,
            _properties: InstanceProperties,
            transaction: &mut dyn ServerTransaction,
            _post_enqueue: Option<EnqueueCallback>,
        ) -> Result<usize, BrokerError> {
            let rollbacks = Arc::clone(&self.rollbacks);
            transaction.add_post_transaction_action(action(
                || Ok(()),
                move || {
                    rollbacks.fetch_add(1, Ordering::SeqCst);
                },
            ))?;
            Err(BrokerError::ActionFailed {
                message: "routing failed".to_string(),
            })
        }
    }

    /// Verify that a failed alternate route rolls back the work it had
    /// registered and leaves the instance in place.
    #[test]
    fn test_route_failure_rolls_back() {
        let store = memory_store();
        let rollbacks = Arc::new(AtomicU32::new(0));
        let router = Arc::new(FailingRouter {
            rollbacks: Arc::clone(&rollbacks),
        });
        let source = Queue::builder(QueueName::new("source-broken").unwrap(), store.clone())
            .alternate_exchange(router)
            .build()
            .unwrap();
        let instance =
            source.enqueue(message(&store, "key", b"x"), InstanceProperties::default(), None);
        instance.acquire(None);

        let result = instance.route_to_alternate(None, None);

        assert!(matches!(result, Err(BrokerError::ActionFailed { .. })));
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(instance.is_acquired());
        assert_eq!(source.message_count(), 1);
    }

    /// Verify that a store refusing the durable records leaves both queues
    /// untouched.
    #[test]
    fn test_route_store_failure() {
        let store = memory_store();
        let dead_letters = Queue::builder(QueueName::new("dlq-durable").unwrap(), store.clone())
            .durable(true)
            .build()
            .unwrap();
        let router = Arc::new(BindingRouter::new("dlx"));
        router.bind("key", Arc::clone(&dead_letters));
        let source = Queue::builder(QueueName::new("source-durable").unwrap(), store.clone())
            .durable(true)
            .alternate_exchange(router)
            .build()
            .unwrap();
        let msg = message_with(
            &store,
            crate::message::PublishInfo::new("amq.direct", Some("key")),
            crate::message::ContentHeader::new(1).persistent(),
            b"x",
        );
        let instance = source.enqueue(msg, InstanceProperties::default(), None);
        instance.acquire(None);
        store.set_fail_records(true);

        let result = instance.route_to_alternate(None, None);

        assert!(matches!(result, Err(BrokerError::Store(_))));
        assert!(instance.is_acquired());
        assert_eq!(source.message_count(), 1);
        assert_eq!(dead_letters.message_count(), 0);
    }
}

mod resend_tests {
    use super::*;

    /// Verify that resend goes back to the holding subscription.
    #[test]
    fn test_resend_to_holder() {
        let (q, instance) = enqueued("resend");
        let (target, subscription) = consume(&q, "c1");
        q.attempt_delivery(&subscription);
        assert_eq!(target.sent().len(), 1);

        assert!(instance.resend());
        assert_eq!(target.sent().len(), 2);
    }

    /// Verify that resend fails once the holder is closed or absent.
    #[test]
    fn test_resend_without_holder() {
        let (q, instance) = enqueued("resend-closed");
        assert!(!instance.resend());

        let (_target, subscription) = consume(&q, "c1");
        q.attempt_delivery(&subscription);
        subscription.close();
        assert!(!instance.resend());
    }
}
