//! The owning resource of message instances.
//!
//! A queue holds the ordered entry list, its subscriptions, an optional
//! alternate route used for dead-lettering, the maximum delivery count and
//! the producer flow limit. It also runs the delivery loop that walks a
//! subscription's cursor along the entry list and hands available entries
//! to the subscription's target.

use crate::channel::Channel;
use crate::collaborators::{EnqueueCallback, Router};
use crate::entry_list::EntryList;
use crate::error::{BrokerError, ValidationError};
use crate::flow_limit::{FlowThresholds, FlowTransition, QueueFlowLimit};
use crate::instance::MessageInstance;
use crate::message::{InstanceProperties, QueueName, ServerMessage, SubscriptionId};
use crate::store::MessageStore;
use crate::subscription::{Subscription, SubscriptionOptions, SubscriptionTarget};
use crate::transaction::{action, AutoCommitTransaction, ServerTransaction};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Queue`]
pub struct QueueBuilder {
    name: QueueName,
    store: Arc<dyn MessageStore>,
    durable: bool,
    maximum_delivery_count: u32,
    flow: FlowThresholds,
    alternate: Option<Arc<dyn Router>>,
}

impl QueueBuilder {
    /// Mark the queue durable so persistent messages are recorded in the store
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Zero disables dead-lettering on delivery count
    pub fn maximum_delivery_count(mut self, count: u32) -> Self {
        self.maximum_delivery_count = count;
        self
    }

    pub fn flow_thresholds(mut self, thresholds: FlowThresholds) -> Self {
        self.flow = thresholds;
        self
    }

    /// Route rejected and over-delivered messages through `router`
    pub fn alternate_exchange(mut self, router: Arc<dyn Router>) -> Self {
        self.alternate = Some(router);
        self
    }

    /// Validate the settings and create the queue
    pub fn build(self) -> Result<Arc<Queue>, ValidationError> {
        let flow_limit = if self.flow.is_enabled() {
            Some(QueueFlowLimit::new(self.name.clone(), self.flow)?)
        } else {
            None
        };

        info!(
            queue = %self.name,
            durable = self.durable,
            maximum_delivery_count = self.maximum_delivery_count,
            "Queue created"
        );

        Ok(Arc::new_cyclic(|weak| Queue {
            name: self.name,
            durable: self.durable,
            maximum_delivery_count: self.maximum_delivery_count,
            store: self.store,
            entries: EntryList::new(),
            subscriptions: RwLock::new(Vec::new()),
            alternate: RwLock::new(self.alternate),
            flow_limit,
            blocked_channels: Mutex::new(Vec::new()),
            depth: AtomicU64::new(0),
            depth_bytes: AtomicU64::new(0),
            work: Notify::new(),
            self_ref: weak.clone(),
        }))
    }
}

// ============================================================================
// Queue
// ============================================================================

pub struct Queue {
    name: QueueName,
    durable: bool,
    maximum_delivery_count: u32,
    store: Arc<dyn MessageStore>,
    entries: EntryList,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    alternate: RwLock<Option<Arc<dyn Router>>>,
    flow_limit: Option<QueueFlowLimit>,
    blocked_channels: Mutex<Vec<Weak<Channel>>>,
    depth: AtomicU64,
    depth_bytes: AtomicU64,
    work: Notify,
    self_ref: Weak<Queue>,
}

impl Queue {
    /// Start building a queue backed by `store`
    pub fn builder(name: QueueName, store: Arc<dyn MessageStore>) -> QueueBuilder {
        QueueBuilder {
            name,
            store,
            durable: false,
            maximum_delivery_count: 0,
            flow: FlowThresholds::default(),
            alternate: None,
        }
    }

    /// Queue name
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Whether persistent messages on this queue are written to the store
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Delivery limit per message; zero means unlimited
    pub fn maximum_delivery_count(&self) -> u32 {
        self.maximum_delivery_count
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Ordered list of every placement on the queue
    pub fn entries(&self) -> &EntryList {
        &self.entries
    }

    /// Router used for dead-lettering, when configured
    pub fn alternate_exchange(&self) -> Option<Arc<dyn Router>> {
        self.alternate.read().clone()
    }

    /// Replace or clear the dead-letter router
    pub fn set_alternate_exchange(&self, router: Option<Arc<dyn Router>>) {
        *self.alternate.write() = router;
    }

    pub fn flow_limit(&self) -> Option<&QueueFlowLimit> {
        self.flow_limit.as_ref()
    }

    /// Whether publishers to this queue should currently be blocked
    pub fn is_flow_stopped(&self) -> bool {
        self.flow_limit.as_ref().is_some_and(QueueFlowLimit::is_flow_stopped)
    }

    /// Entries enqueued and not yet dispensed
    pub fn message_count(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Total body size of the entries counted by `message_count`
    pub fn queue_depth_bytes(&self) -> u64 {
        self.depth_bytes.load(Ordering::SeqCst)
    }

    /// Entries currently available for acquisition
    pub fn available_count(&self) -> usize {
        self.entries.iter().filter(|instance| instance.is_available()).count()
    }

    // ------------------------------------------------------------------------
    // Enqueue and dispense
    // ------------------------------------------------------------------------

    /// Append a message, offer it to the subscriptions and run `post_enqueue`
    /// against the new instance.
    pub fn enqueue(
        &self,
        message: Arc<ServerMessage>,
        properties: InstanceProperties,
        post_enqueue: Option<EnqueueCallback>,
    ) -> Arc<MessageInstance> {
        let size = message.size();
        let instance = self.entries.append(|entry_id| {
            MessageInstance::new(entry_id, Arc::clone(&message), self.self_ref.clone(), properties)
        });

        self.depth.fetch_add(1, Ordering::SeqCst);
        self.depth_bytes.fetch_add(size, Ordering::SeqCst);
        if let Some(flow) = &self.flow_limit {
            flow.enqueued(size);
        }

        debug!(
            queue = %self.name,
            entry_id = %instance.entry_id(),
            message_number = message.message_number(),
            "Message enqueued"
        );

        self.deliver_pending();

        if let Some(callback) = post_enqueue {
            callback(&instance);
        }
        instance
    }

    /// Account for an instance reaching a terminal state
    pub(crate) fn entry_dispensed(&self, instance: &MessageInstance) {
        let size = instance.message().size();
        let _ = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_sub(1));
        let _ = self
            .depth_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bytes| {
                Some(bytes.saturating_sub(size))
            });

        let resumed = self
            .flow_limit
            .as_ref()
            .is_some_and(|flow| flow.dequeued(size) == FlowTransition::Resumed);
        if resumed {
            let blocked: Vec<_> = std::mem::take(&mut *self.blocked_channels.lock());
            for channel in blocked.iter().filter_map(Weak::upgrade) {
                channel.unblock_queue(self);
            }
        }
    }

    /// An instance was released back to `AVAILABLE`
    pub(crate) fn requeue(&self, instance: &MessageInstance) {
        debug!(queue = %self.name, entry_id = %instance.entry_id(), "Entry requeued");
        for subscription in self.subscriptions.read().iter() {
            subscription.request_rescan();
        }
        self.work.notify_one();
    }

    /// Block `channel` on this queue while it is over its flow limit
    pub fn check_capacity(&self, channel: &Arc<Channel>) {
        if !self.is_flow_stopped() {
            return;
        }

        {
            let mut blocked = self.blocked_channels.lock();
            blocked.retain(|weak| weak.strong_count() > 0);
            if !blocked.iter().any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(channel))) {
                blocked.push(Arc::downgrade(channel));
            }
        }
        channel.block_queue(self);

        // A dequeue may have resumed flow between the check and the block.
        if !self.is_flow_stopped() {
            self.blocked_channels
                .lock()
                .retain(|weak| !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(channel)));
            channel.unblock_queue(self);
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Attach a new subscription. Fails when the queue has an exclusive
    /// subscription, or when an exclusive one is requested on a queue that
    /// already has subscribers.
    pub fn register_subscription(
        self: &Arc<Self>,
        target: Arc<dyn SubscriptionTarget>,
        options: SubscriptionOptions,
    ) -> Result<Arc<Subscription>, BrokerError> {
        let mut subscriptions = self.subscriptions.write();
        let exclusive_held = subscriptions.iter().any(|sub| sub.is_exclusive());
        if exclusive_held || (options.exclusive && !subscriptions.is_empty()) {
            return Err(BrokerError::ExclusiveConsumer {
                queue: self.name.to_string(),
            });
        }

        let subscription = Arc::new(Subscription::new(self, target, options));
        subscriptions.push(Arc::clone(&subscription));
        debug!(
            queue = %self.name,
            subscription = %subscription.id(),
            consumer_tag = %subscription.consumer_tag(),
            "Subscription registered"
        );
        Ok(subscription)
    }

    /// Detach a subscription, returning it when it was registered
    pub fn unregister_subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let mut subscriptions = self.subscriptions.write();
        let position = subscriptions.iter().position(|sub| sub.id() == id)?;
        Some(subscriptions.remove(position))
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().clone()
    }

    /// Number of registered subscriptions
    pub fn consumer_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Offer available entries to every subscription, one entry per
    /// subscription per round, until no subscription makes progress.
    pub fn deliver_pending(&self) -> usize {
        let mut total = 0;
        loop {
            let subscriptions = self.subscriptions();
            let delivered = subscriptions.iter().filter(|sub| self.deliver_one(sub)).count();
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Deliver to one subscription until it is suspended, out of credit or
    /// has reached the end of the list
    pub fn attempt_delivery(&self, subscription: &Arc<Subscription>) -> usize {
        let mut delivered = 0;
        while self.deliver_one(subscription) {
            delivered += 1;
        }
        delivered
    }

    /// Ask the background delivery task to run
    pub fn deliver_async(&self) {
        self.work.notify_one();
    }

    /// Wait until delivery work is signalled
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    /// Run deliveries in the background whenever work is signalled
    pub fn spawn_delivery(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                queue.wait_for_work().await;
                let delivered = queue.deliver_pending();
                if delivered > 0 {
                    debug!(queue = %queue.name, delivered, "Background delivery pass");
                }
            }
        })
    }

    fn deliver_one(&self, subscription: &Arc<Subscription>) -> bool {
        let mut cursor = subscription.send_lock();
        let target = subscription.target();

        loop {
            if subscription.is_suspended() {
                return false;
            }
            let generation = target.generation();

            if subscription.take_rescan() {
                *cursor = self.entries.head();
            }

            let Some(node) = cursor.next_valid() else {
                return false;
            };
            let Some(instance) = node.instance().cloned() else {
                *cursor = node;
                continue;
            };

            if !instance.is_available() || instance.is_rejected_by(subscription.id()) {
                *cursor = node;
                continue;
            }

            if instance.expired() {
                self.expire(&instance);
                *cursor = node;
                continue;
            }

            let message = Arc::clone(instance.message());
            if !target.allocate_credit(&message) {
                return false;
            }

            if subscription.acquires() && !instance.acquire(Some(subscription)) {
                target.restore_credit(&message);
                *cursor = node;
                continue;
            }

            // A state change drained this subscription after the checks above.
            if target.generation() != generation && subscription.is_suspended() {
                if subscription.acquires() {
                    instance.release();
                }
                target.restore_credit(&message);
                return false;
            }

            match target.send(subscription, &instance) {
                Ok(()) => {
                    *cursor = node;
                    return true;
                }
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        subscription = %subscription.id(),
                        error = %e,
                        "Delivery failed"
                    );
                    if subscription.acquires() {
                        instance.release();
                    }
                    target.restore_credit(&message);
                    return false;
                }
            }
        }
    }

    fn expire(&self, instance: &Arc<MessageInstance>) {
        if !instance.acquire(None) {
            return;
        }

        let expired = Arc::clone(instance);
        let mut txn = AutoCommitTransaction::new(Arc::clone(&self.store));
        let result = txn.dequeue(
            std::slice::from_ref(instance),
            action(
                move || {
                    expired.dequeue();
                    Ok(())
                },
                || {},
            ),
        );

        match result {
            Ok(()) => debug!(
                queue = %self.name,
                message_number = instance.message().message_number(),
                "Expired message dequeued"
            ),
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Store dequeue of expired message failed");
                instance.dequeue();
            }
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("message_count", &self.message_count())
            .field("consumer_count", &self.consumer_count())
            .finish()
    }
}
