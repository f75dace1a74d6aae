//! The placement of one message on one queue and its state machine.
//!
//! ```text
//!            acquire            delete / dequeue
//! AVAILABLE ─────────► ACQUIRED ─────────────────► DELETED | DEQUEUED
//!     ▲                    │
//!     └────── release ─────┘
//! ```
//!
//! `DEQUEUED` and `DELETED` are terminal ("dispensed"). Every transition is a
//! compare-and-swap on the state slot, so two subscriptions racing to acquire
//! the same instance can never both win.

use crate::collaborators::EnqueueCallback;
use crate::error::BrokerError;
use crate::message::{EntryId, InstanceProperties, ServerMessage, SubscriptionId, Timestamp};
use crate::queue::Queue;
use crate::subscription::Subscription;
use crate::transaction::{action, LocalTransaction, ServerTransaction, TransactionState};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;

// ============================================================================
// Entry State
// ============================================================================

/// Discriminant of [`EntryState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Available,
    Acquired,
    Dequeued,
    Deleted,
}

impl StateKind {
    pub fn is_dispensed(self) -> bool {
        matches!(self, Self::Dequeued | Self::Deleted)
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Available => "AVAILABLE",
            Self::Acquired => "ACQUIRED",
            Self::Dequeued => "DEQUEUED",
            Self::Deleted => "DELETED",
        };
        write!(f, "{}", name)
    }
}

/// State of a message instance.
///
/// An acquisition made outside a subscription (immediate-delivery probing,
/// expiry) carries no subscription.
#[derive(Clone)]
pub enum EntryState {
    Available,
    Acquired { subscription: Option<Arc<Subscription>> },
    Dequeued,
    Deleted,
}

impl EntryState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Available => StateKind::Available,
            Self::Acquired { .. } => StateKind::Acquired,
            Self::Dequeued => StateKind::Dequeued,
            Self::Deleted => StateKind::Deleted,
        }
    }

    pub fn is_dispensed(&self) -> bool {
        self.kind().is_dispensed()
    }

    /// The acquiring subscription, if any
    pub fn subscription(&self) -> Option<&Arc<Subscription>> {
        match self {
            Self::Acquired { subscription } => subscription.as_ref(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquired {
                subscription: Some(sub),
            } => write!(f, "{{ACQUIRED : {}}}", sub.id()),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Observer of state transitions
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, instance: &MessageInstance, old: StateKind, new: StateKind);
}

impl<F> StateChangeListener for F
where
    F: Fn(&MessageInstance, StateKind, StateKind) + Send + Sync,
{
    fn state_changed(&self, instance: &MessageInstance, old: StateKind, new: StateKind) {
        self(instance, old, new)
    }
}

// ============================================================================
// Message Instance
// ============================================================================

/// One message placed on one queue
pub struct MessageInstance {
    entry_id: EntryId,
    message: Arc<ServerMessage>,
    queue: Weak<Queue>,
    properties: InstanceProperties,
    state: ArcSwap<EntryState>,
    delivery_count: AtomicU32,
    redelivered: AtomicBool,
    delivered_to_consumer: AtomicBool,
    rejected_by: Mutex<HashSet<SubscriptionId>>,
    listeners: Mutex<Vec<Arc<dyn StateChangeListener>>>,
}

impl MessageInstance {
    pub fn new(
        entry_id: EntryId,
        message: Arc<ServerMessage>,
        queue: Weak<Queue>,
        properties: InstanceProperties,
    ) -> Self {
        Self {
            entry_id,
            message,
            queue,
            properties,
            state: ArcSwap::from_pointee(EntryState::Available),
            delivery_count: AtomicU32::new(0),
            redelivered: AtomicBool::new(properties.redelivered),
            delivered_to_consumer: AtomicBool::new(false),
            rejected_by: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Position of this placement within the queue's entry list
    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// Shared message this placement refers to
    pub fn message(&self) -> &Arc<ServerMessage> {
        &self.message
    }

    /// Queue owning this placement, while it is still alive
    pub fn owning_queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    /// Snapshot of the per-placement properties captured at enqueue
    pub fn instance_properties(&self) -> InstanceProperties {
        self.properties
    }

    // ------------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------------

    /// Current lifecycle state
    pub fn state(&self) -> EntryState {
        EntryState::clone(&self.state.load())
    }

    pub fn state_kind(&self) -> StateKind {
        self.state.load().kind()
    }

    /// Whether the instance can be acquired right now
    pub fn is_available(&self) -> bool {
        self.state_kind() == StateKind::Available
    }

    /// Whether some owner currently holds the instance
    pub fn is_acquired(&self) -> bool {
        self.state_kind() == StateKind::Acquired
    }

    /// Whether the instance has been removed from its queue
    pub fn is_deleted(&self) -> bool {
        self.state_kind() == StateKind::Deleted
    }

    /// Whether the instance has left the queue, either dequeued or deleted
    pub fn is_dispensed(&self) -> bool {
        self.state_kind().is_dispensed()
    }

    /// Whether the given subscription holds the acquisition
    pub fn is_acquired_by(&self, subscription: SubscriptionId) -> bool {
        self.state
            .load()
            .subscription()
            .is_some_and(|sub| sub.id() == subscription)
    }

    /// Whether the current acquisition was made by a subscription
    pub fn acquired_by_subscription(&self) -> bool {
        self.state.load().subscription().is_some()
    }

    /// Subscription holding the instance, if it is acquired by one
    pub fn delivered_subscription(&self) -> Option<Arc<Subscription>> {
        self.state.load().subscription().cloned()
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Acquire the instance, optionally on behalf of a subscription.
    ///
    /// Succeeds only from `AVAILABLE`.
    pub fn acquire(&self, subscription: Option<&Arc<Subscription>>) -> bool {
        let acquired = self
            .transition(
                |state| matches!(state, EntryState::Available),
                || EntryState::Acquired {
                    subscription: subscription.cloned(),
                },
            )
            .is_some();

        if acquired {
            self.notify(StateKind::Available, StateKind::Acquired);
        }
        acquired
    }

    /// Return an acquired instance to `AVAILABLE`.
    ///
    /// The delivery count and redelivered flag are left alone. The owning
    /// queue is told so requeue-aware subscriptions rescan it.
    pub fn release(&self) -> bool {
        let released = self
            .transition(
                |state| matches!(state, EntryState::Acquired { .. }),
                || EntryState::Available,
            )
            .is_some();

        if released {
            self.notify(StateKind::Acquired, StateKind::Available);
            if let Some(queue) = self.queue.upgrade() {
                queue.requeue(self);
            }
        }
        released
    }

    /// Move a non-dispensed instance to `DELETED`. Deleting twice is a no-op
    /// and notifies listeners once.
    pub fn delete(&self) -> bool {
        match self.transition(|state| !state.is_dispensed(), || EntryState::Deleted) {
            Some(old) => {
                self.notify(old, StateKind::Deleted);
                if let Some(queue) = self.queue.upgrade() {
                    queue.entry_dispensed(self);
                }
                true
            }
            None => false,
        }
    }

    /// Move a non-dispensed instance to `DEQUEUED`
    pub fn dequeue(&self) -> bool {
        match self.transition(|state| !state.is_dispensed(), || EntryState::Dequeued) {
            Some(old) => {
                self.notify(old, StateKind::Dequeued);
                if let Some(queue) = self.queue.upgrade() {
                    queue.entry_dispensed(self);
                }
                true
            }
            None => false,
        }
    }

    fn transition(
        &self,
        accept: impl Fn(&EntryState) -> bool,
        next: impl Fn() -> EntryState,
    ) -> Option<StateKind> {
        loop {
            let current = self.state.load();
            if !accept(&current) {
                return None;
            }

            let previous = self.state.compare_and_swap(&current, Arc::new(next()));
            if Arc::ptr_eq(&previous, &current) {
                return Some(current.kind());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Rejection and rerouting
    // ------------------------------------------------------------------------

    /// Record that a subscription refused this instance so it is not offered
    /// to that subscription again.
    pub fn reject(&self, subscription: SubscriptionId) {
        if !self.is_dispensed() {
            self.rejected_by.lock().insert(subscription);
        }
    }

    /// Whether the given subscription has rejected this instance before
    pub fn is_rejected_by(&self, subscription: SubscriptionId) -> bool {
        self.rejected_by.lock().contains(&subscription)
    }

    /// Route the message to the owning queue's alternate exchange and
    /// dequeue this instance.
    ///
    /// Uses `transaction` when given, otherwise a one-off local transaction
    /// committed before returning. Returns the number of queues the message
    /// was enqueued on.
    pub fn route_to_alternate(
        self: &Arc<Self>,
        post_enqueue: Option<EnqueueCallback>,
        transaction: Option<&mut dyn ServerTransaction>,
    ) -> Result<usize, BrokerError> {
        let Some(queue) = self.queue.upgrade() else {
            return Ok(0);
        };

        let autocommit = transaction.is_none();
        let mut local = None;
        let txn: &mut dyn ServerTransaction = match transaction {
            Some(txn) => txn,
            None => local.insert(LocalTransaction::new(Arc::clone(queue.store()))),
        };

        let enqueues = match self.route_and_dequeue(&queue, post_enqueue, txn) {
            Ok(enqueues) => enqueues,
            Err(e) => {
                if autocommit && txn.state() == TransactionState::Active {
                    if let Err(rollback) = txn.rollback() {
                        warn!(
                            queue = %queue.name(),
                            error = %rollback,
                            "Rollback of alternate routing failed",
                        );
                    }
                }
                return Err(e);
            }
        };

        if autocommit {
            txn.commit(None)?;
        }

        debug!(
            queue = %queue.name(),
            message_number = self.message.message_number(),
            enqueues,
            "Routed entry to alternate exchange"
        );
        Ok(enqueues)
    }

    fn route_and_dequeue(
        self: &Arc<Self>,
        queue: &Queue,
        post_enqueue: Option<EnqueueCallback>,
        txn: &mut dyn ServerTransaction,
    ) -> Result<usize, BrokerError> {
        let enqueues = match queue.alternate_exchange() {
            Some(alternate) => {
                let mut properties = self.properties;
                properties.redelivered = self.is_redelivered();
                alternate.send(&self.message, properties, txn, post_enqueue)?
            }
            None => 0,
        };

        let dequeued = Arc::clone(self);
        txn.dequeue(
            std::slice::from_ref(self),
            action(
                move || {
                    dequeued.dequeue();
                    Ok(())
                },
                || {},
            ),
        )?;
        Ok(enqueues)
    }

    // ------------------------------------------------------------------------
    // Delivery bookkeeping
    // ------------------------------------------------------------------------

    /// Ask the acquiring subscription to deliver this instance again
    pub fn resend(self: &Arc<Self>) -> bool {
        match self.delivered_subscription() {
            Some(sub) if !sub.is_closed() => sub.resend(self),
            _ => false,
        }
    }

    /// Number of deliveries made so far
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    /// Count one more delivery
    pub fn increment_delivery_count(&self) {
        self.delivery_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one delivery. Never drops below zero.
    pub fn decrement_delivery_count(&self) {
        let _ = self
            .delivery_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }

    /// Mark the instance so the next delivery carries the redelivered flag
    pub fn set_redelivered(&self) {
        self.redelivered.store(true, Ordering::SeqCst);
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::SeqCst)
    }

    pub fn set_delivered_to_consumer(&self) {
        self.delivered_to_consumer.store(true, Ordering::SeqCst);
    }

    pub fn delivered_to_consumer(&self) -> bool {
        self.delivered_to_consumer.load(Ordering::SeqCst)
    }

    /// Whether the message expiration has passed
    pub fn expired(&self) -> bool {
        self.properties
            .expiration
            .is_some_and(|expiration| expiration <= Timestamp::now())
    }

    /// Maximum deliveries allowed by the owning queue; zero disables the limit
    pub fn maximum_delivery_count(&self) -> u32 {
        self.queue
            .upgrade()
            .map(|queue| queue.maximum_delivery_count())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Register a listener notified on every state transition
    pub fn add_state_change_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.lock().push(listener);
    }

    /// Remove a listener, returning whether it was registered
    pub fn remove_state_change_listener(&self, listener: &Arc<dyn StateChangeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != listeners.len()
    }

    fn notify(&self, old: StateKind, new: StateKind) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.state_changed(self, old, new);
        }
    }
}

impl std::fmt::Debug for MessageInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInstance")
            .field("entry_id", &self.entry_id)
            .field("message_number", &self.message.message_number())
            .field("state", &*self.state.load())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}
