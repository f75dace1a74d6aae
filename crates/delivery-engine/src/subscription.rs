//! A consumer attached to a queue.
//!
//! A [`Subscription`] pairs a queue with a [`SubscriptionTarget`], the sink
//! that actually hands instances to the client (and owns the credit and
//! suspension state). Deliveries to one subscription are serialized by its
//! send lock, which also guards the subscription's cursor into the queue's
//! entry list.

use crate::entry_list::EntryNode;
use crate::error::BrokerError;
use crate::instance::MessageInstance;
use crate::message::{ConsumerTag, ServerMessage, SubscriptionId};
use crate::queue::Queue;
use crate::quiesce::Generation;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;

// ============================================================================
// Options and State
// ============================================================================

/// Acquisition and visibility options of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Consumes the instances it is sent
    pub acquires: bool,
    /// Rescans the queue when an instance is released back to it
    pub sees_requeues: bool,
    /// No other subscription may share the queue
    pub exclusive: bool,
    /// Browse only; never acquires
    pub transient: bool,
}

impl SubscriptionOptions {
    /// Options for a subscription that acquires what it delivers
    pub fn consuming() -> Self {
        Self {
            acquires: true,
            sees_requeues: true,
            ..Self::default()
        }
    }

    /// Options for a subscription that delivers without acquiring
    pub fn browsing() -> Self {
        Self {
            transient: true,
            ..Self::default()
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Suspended,
    Closed,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Suspended,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Suspended => 1,
            Self::Closed => 2,
        }
    }
}

// ============================================================================
// Target
// ============================================================================

/// Delivery sink behind a subscription
pub trait SubscriptionTarget: Send + Sync {
    fn consumer_tag(&self) -> &ConsumerTag;

    /// Whether delivery is currently held back (flow, credit, closing)
    fn is_suspended(&self) -> bool;

    /// Generation of the owner's drain barrier
    fn generation(&self) -> Generation;

    fn allocate_credit(&self, message: &ServerMessage) -> bool;

    fn restore_credit(&self, message: &ServerMessage);

    /// Hand an instance to the client. Called with the send lock held.
    fn send(
        &self,
        subscription: &Arc<Subscription>,
        instance: &Arc<MessageInstance>,
    ) -> Result<(), BrokerError>;
}

// ============================================================================
// Subscription
// ============================================================================

pub struct Subscription {
    id: SubscriptionId,
    consumer_tag: ConsumerTag,
    options: SubscriptionOptions,
    state: AtomicU8,
    queue: Weak<Queue>,
    target: Arc<dyn SubscriptionTarget>,
    cursor: Mutex<Arc<EntryNode>>,
    rescan: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        queue: &Arc<Queue>,
        target: Arc<dyn SubscriptionTarget>,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            id: SubscriptionId::next(),
            consumer_tag: target.consumer_tag().clone(),
            options,
            state: AtomicU8::new(SubscriptionState::Active.as_u8()),
            queue: Arc::downgrade(queue),
            cursor: Mutex::new(queue.entries().head()),
            target,
            rescan: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    pub fn options(&self) -> SubscriptionOptions {
        self.options
    }

    /// Whether delivered messages are acquired
    pub fn acquires(&self) -> bool {
        self.options.acquires
    }

    /// Whether released messages are offered to this subscription again
    pub fn sees_requeues(&self) -> bool {
        self.options.sees_requeues
    }

    pub fn is_exclusive(&self) -> bool {
        self.options.exclusive
    }

    pub fn is_transient(&self) -> bool {
        self.options.transient
    }

    /// Queue the subscription is attached to, while it is still alive
    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    pub fn target(&self) -> &Arc<dyn SubscriptionTarget> {
        &self.target
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Closed, or held back by its target
    pub fn is_suspended(&self) -> bool {
        self.is_closed() || self.target.is_suspended()
    }

    /// Whether the subscription is open and not suspended
    pub fn is_active(&self) -> bool {
        !self.is_suspended()
    }

    /// Mark the subscription suspended or active. No effect once closed.
    pub fn set_suspended(&self, suspended: bool) {
        let (from, to) = if suspended {
            (SubscriptionState::Active, SubscriptionState::Suspended)
        } else {
            (SubscriptionState::Suspended, SubscriptionState::Active)
        };
        let _ = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Close and detach from the queue. Returns false if already closed.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(SubscriptionState::Closed.as_u8(), Ordering::SeqCst);
        if SubscriptionState::from_u8(previous) == SubscriptionState::Closed {
            return false;
        }

        // Wait out a delivery in flight so nothing is sent after close returns.
        drop(self.send_lock());

        if let Some(queue) = self.queue.upgrade() {
            queue.unregister_subscription(self.id);
        }
        debug!(subscription = %self.id, consumer_tag = %self.consumer_tag, "Subscription closed");
        true
    }

    /// Serialize against deliveries to this subscription. The guard holds
    /// the subscription's cursor into the queue.
    pub fn send_lock(&self) -> MutexGuard<'_, Arc<EntryNode>> {
        self.cursor.lock()
    }

    /// Ask for the next delivery attempt to restart from the queue head
    pub fn request_rescan(&self) {
        if self.options.sees_requeues {
            self.rescan.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn take_rescan(&self) -> bool {
        self.rescan.swap(false, Ordering::SeqCst)
    }

    /// Deliver an instance this subscription already holds once more
    pub fn resend(self: &Arc<Self>, instance: &Arc<MessageInstance>) -> bool {
        let _guard = self.send_lock();
        if self.is_closed() || !instance.is_acquired_by(self.id) {
            return false;
        }

        match self.target.send(self, instance) {
            Ok(()) => true,
            Err(e) => {
                debug!(subscription = %self.id, error = %e, "Resend failed");
                false
            }
        }
    }

    /// Nudge the owning queue to retry delivery after a state change
    pub fn external_state_change(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.deliver_async();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("consumer_tag", &self.consumer_tag)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}
