//! # Channel
//!
//! The per-session orchestrator. A channel assembles incoming publishes,
//! owns the unacknowledged-message map and the active transaction, manages
//! its consumers and their shared credit, and drives message instances
//! through their states in response to acknowledgements, rejects, requeues,
//! rollbacks and close.
//!
//! ## Locking
//!
//! Delivery threads never take the channel's operation lock or its
//! transaction lock; they only touch the delivery ledger. Sequences that
//! must not interleave with delivery (suspend, commit, rollback, close,
//! block) serialize on the operation lock and then drain every consumer's
//! send lock through the channel's [`QuiesceBarrier`]. Synchronous delivery
//! is only started once no channel lock is held.

pub mod actions;
pub mod incoming;
pub mod target;

pub use actions::{AcknowledgeAction, WriteReturnAction, IMMEDIATE_DELIVERY_REPLY_TEXT};
pub use incoming::{AssemblyState, IncomingMessage};
pub use target::{ConsumerMode, ConsumerTarget};

use crate::collaborators::{ConnectionModel, ProtocolOutput, Router};
use crate::config::ChannelConfig;
use crate::credit::CreditManager;
use crate::error::{BrokerError, ReplyCode};
use crate::instance::MessageInstance;
use crate::message::{
    ChannelId, ConsumerTag, ContentHeader, DeliveryTag, InstanceProperties, MessageMetaData,
    PublishInfo, QueueName, ServerMessage, Timestamp,
};
use crate::queue::Queue;
use crate::quiesce::{Generation, QuiesceBarrier};
use crate::store::MessageStore;
use crate::subscription::Subscription;
use crate::timeout::{TransactionTimeoutHelper, TransactionTimeouts};
use crate::transaction::{
    action, ActivityClock, AsyncAutoCommitTransaction, AutoCommitTransaction, LocalTransaction,
    PendingCommands, ServerTransaction, TransactionState,
};
use crate::unacked::{Disposition, UnackedEntry, UnacknowledgedMessageMap};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Label used in flow log events when the whole channel is blocked
pub const ALL_QUEUES: &str = "** All Queues **";

// ============================================================================
// Supporting Types
// ============================================================================

/// Something that asked for the channel's publishers to be held back
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockingEntity {
    Channel,
    Queue(QueueName),
}

/// The channel's current unit of work
enum ChannelTransaction {
    AutoCommit(AsyncAutoCommitTransaction),
    Local(LocalTransaction),
}

impl ChannelTransaction {
    fn get(&self) -> &dyn ServerTransaction {
        match self {
            Self::AutoCommit(txn) => txn,
            Self::Local(txn) => txn,
        }
    }

    fn get_mut(&mut self) -> &mut dyn ServerTransaction {
        match self {
            Self::AutoCommit(txn) => txn,
            Self::Local(txn) => txn,
        }
    }
}

/// Delivery tag allocation and the deliveries awaiting acknowledgement
#[derive(Default)]
struct DeliveryLedger {
    last_tag: u64,
    unacked: UnacknowledgedMessageMap,
}

impl DeliveryLedger {
    fn next_tag(&mut self) -> DeliveryTag {
        self.last_tag += 1;
        DeliveryTag::from_raw(self.last_tag)
    }
}

/// Transaction counters exposed for management
#[derive(Debug, Default)]
pub struct TransactionStats {
    starts: AtomicU64,
    commits: AtomicU64,
    rejects: AtomicU64,
    outstanding: AtomicU64,
}

impl TransactionStats {
    fn committed(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = self.outstanding.compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn rolled_back(&self) {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = self.outstanding.compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    // Only one local transaction can be open at a time.
    fn work_joined(&self) {
        let _ = self.outstanding.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rejects(&self) -> u64 {
        self.rejects.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Channel
// ============================================================================

pub struct Channel {
    id: ChannelId,
    uuid: Uuid,
    config: ChannelConfig,
    connection: Arc<dyn ConnectionModel>,
    output: Arc<dyn ProtocolOutput>,
    store: Arc<dyn MessageStore>,
    self_ref: Weak<Channel>,

    op_lock: Mutex<()>,
    current_message: Mutex<Option<IncomingMessage>>,
    ledger: Mutex<DeliveryLedger>,
    consumers: Mutex<HashMap<ConsumerTag, Arc<Subscription>>>,
    consumer_sequence: AtomicU32,
    transaction: Mutex<ChannelTransaction>,
    pending: PendingCommands,
    credit: Arc<CreditManager>,
    default_queue: Mutex<Option<Arc<Queue>>>,
    barrier: QuiesceBarrier,

    suspended: AtomicBool,
    closing: AtomicBool,
    blocking: AtomicBool,
    rolling_back: Arc<AtomicBool>,
    blocking_entities: Mutex<HashSet<BlockingEntity>>,
    resend_list: Arc<Mutex<Vec<Arc<MessageInstance>>>>,
    stats: Arc<TransactionStats>,
    timeout_helper: TransactionTimeoutHelper,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        connection: Arc<dyn ConnectionModel>,
        store: Arc<dyn MessageStore>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let pending = PendingCommands::new();
        let credit = Arc::new(CreditManager::new(config.prefetch_size, config.prefetch_count));
        let transaction = ChannelTransaction::AutoCommit(AsyncAutoCommitTransaction::new(
            Arc::clone(&store),
            pending.clone(),
        ));

        info!(channel = %id, "Channel created");

        Arc::new_cyclic(|weak| Self {
            id,
            uuid: Uuid::new_v4(),
            output: connection.output(),
            timeout_helper: TransactionTimeoutHelper::new(format!("channel {}", id)),
            config,
            connection,
            store,
            self_ref: weak.clone(),
            op_lock: Mutex::new(()),
            current_message: Mutex::new(None),
            ledger: Mutex::new(DeliveryLedger::default()),
            consumers: Mutex::new(HashMap::new()),
            consumer_sequence: AtomicU32::new(0),
            transaction: Mutex::new(transaction),
            pending,
            credit,
            default_queue: Mutex::new(None),
            barrier: QuiesceBarrier::new(),
            suspended: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            rolling_back: Arc::new(AtomicBool::new(false)),
            blocking_entities: Mutex::new(HashSet::new()),
            resend_list: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(TransactionStats::default()),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Channel number on its connection
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Unique identifier, stable for the life of the channel
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn ConnectionModel> {
        &self.connection
    }

    /// Writer for frames sent to the client
    pub fn output(&self) -> Arc<dyn ProtocolOutput> {
        Arc::clone(&self.output)
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Prefetch credit shared by all subscriptions on this channel
    pub fn credit(&self) -> &CreditManager {
        &self.credit
    }

    /// Current quiescence generation
    pub fn generation(&self) -> Generation {
        self.barrier.snapshot()
    }

    /// Queue used when a publish or consume names no queue
    pub fn set_default_queue(&self, queue: Option<Arc<Queue>>) {
        *self.default_queue.lock() = queue;
    }

    pub fn default_queue(&self) -> Option<Arc<Queue>> {
        self.default_queue.lock().clone()
    }

    /// Whether `close` has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether publishing is currently blocked by flow control
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    /// Whether outbound delivery is held back
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
            || self.is_closing()
            || self.connection.is_closing()
            || self.is_blocking()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Subscription registered under `tag`
    pub fn subscription(&self, tag: &ConsumerTag) -> Option<Arc<Subscription>> {
        self.consumers.lock().get(tag).cloned()
    }

    pub fn unacknowledged_message_count(&self) -> usize {
        self.ledger.lock().unacked.size()
    }

    /// Outstanding delivery tags in tag order
    pub fn unacknowledged_tags(&self) -> Vec<DeliveryTag> {
        self.ledger.lock().unacked.tags()
    }

    /// Instance delivered under `tag` and not yet settled
    pub fn unacknowledged_instance(&self, tag: DeliveryTag) -> Option<Arc<MessageInstance>> {
        self.ledger
            .lock()
            .unacked
            .get(tag)
            .map(|entry| Arc::clone(&entry.instance))
    }

    /// Counters for transactions run on this channel
    pub fn transaction_stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn txn_starts(&self) -> u64 {
        self.stats.starts()
    }

    pub fn txn_commits(&self) -> u64 {
        self.stats.commits()
    }

    pub fn txn_rejects(&self) -> u64 {
        self.stats.rejects()
    }

    pub fn txn_count(&self) -> u64 {
        self.stats.outstanding()
    }

    /// Async commands still waiting for their store future
    pub fn pending_command_count(&self) -> usize {
        self.pending.len()
    }

    fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.consumers.lock().values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Switch the channel to client-demarcated transactions
    pub fn set_local_transactional(&self) {
        let mut txn = self.transaction.lock();
        if !matches!(*txn, ChannelTransaction::Local(_)) {
            *txn = ChannelTransaction::Local(self.new_local_transaction());
            debug!(channel = %self.id, "Channel is now transactional");
        }
    }

    /// Whether the channel runs a local transaction rather than auto-commit
    pub fn is_transactional(&self) -> bool {
        self.transaction.lock().get().is_transactional()
    }

    fn new_local_transaction(&self) -> LocalTransaction {
        let connection = Arc::clone(&self.connection);
        let clock: ActivityClock = Arc::new(move || connection.last_received_time());
        LocalTransaction::with_activity_clock(Arc::clone(&self.store), clock)
    }

    /// Commit the local transaction.
    ///
    /// `immediate` runs after the committed actions, before delivery to
    /// consumers resumes.
    pub fn commit(&self, immediate: Option<Box<dyn FnOnce() + Send>>) -> Result<(), BrokerError> {
        if !self.is_transactional() {
            return Err(BrokerError::NotTransactional {
                operation: "commit".to_string(),
            });
        }

        let result = {
            let _op = self.op_lock.lock();
            self.quiesce();

            let mut txn = self.transaction.lock();
            let result = txn.get_mut().commit(immediate);
            if txn.get().state() == TransactionState::RolledBack {
                self.stats.rolled_back();
            } else {
                self.stats.committed();
            }
            *txn = ChannelTransaction::Local(self.new_local_transaction());
            result
        };

        match &result {
            Ok(()) => debug!(channel = %self.id, "Transaction committed"),
            Err(e) => warn!(channel = %self.id, error = %e, "Transaction commit failed"),
        }
        self.deliver_to_consumers();
        result
    }

    /// Commit without waiting for the store. The post-commit work and
    /// `immediate` run when the channel next syncs.
    pub fn commit_async(
        &self,
        immediate: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), BrokerError> {
        let _op = self.op_lock.lock();
        let mut txn = self.transaction.lock();

        let ChannelTransaction::Local(local) = &mut *txn else {
            return Err(BrokerError::NotTransactional {
                operation: "commit".to_string(),
            });
        };

        let stats = Arc::clone(&self.stats);
        let on_complete: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(immediate) = immediate {
                immediate();
            }
            stats.committed();
        });

        let handle = local.commit_async(Some(on_complete));
        *txn = ChannelTransaction::Local(self.new_local_transaction());
        let (future, outcome) = handle?.into_parts();
        self.pending.record(future, outcome);
        Ok(())
    }

    /// Roll back the local transaction
    pub fn rollback(&self) -> Result<(), BrokerError> {
        self.rollback_with(|| {})
    }

    /// Roll back the open transaction, run `post_rollback`, then redeliver
    /// whatever the rolled-back acknowledgements had covered.
    pub fn rollback_with(&self, post_rollback: impl FnOnce()) -> Result<(), BrokerError> {
        if !self.is_transactional() {
            return Err(BrokerError::NotTransactional {
                operation: "rollback".to_string(),
            });
        }

        let (result, requires_unsuspend) = {
            let _op = self.op_lock.lock();

            self.rolling_back.store(true, Ordering::SeqCst);
            let requires_unsuspend = self
                .suspended
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            self.quiesce();

            let result = {
                let mut txn = self.transaction.lock();
                let result = txn.get_mut().rollback();
                *txn = ChannelTransaction::Local(self.new_local_transaction());
                result
            };
            self.rolling_back.store(false, Ordering::SeqCst);
            self.stats.rolled_back();

            post_rollback();

            let resend: Vec<_> = std::mem::take(&mut *self.resend_list.lock());
            for instance in resend {
                self.resend_after_rollback(&instance);
            }

            if requires_unsuspend {
                self.suspended.store(false, Ordering::SeqCst);
            }
            (result, requires_unsuspend)
        };

        debug!(channel = %self.id, "Transaction rolled back");
        if requires_unsuspend {
            self.deliver_to_consumers();
        }
        result
    }

    fn resend_after_rollback(&self, instance: &Arc<MessageInstance>) {
        let live = instance
            .delivered_subscription()
            .is_some_and(|subscription| !subscription.is_closed());

        if live {
            // The resend counts as a delivery again.
            instance.decrement_delivery_count();
            if instance.resend() {
                return;
            }
        }

        instance.set_redelivered();
        self.credit.restore(1, instance.message().size());
        instance.release();
    }

    /// Wait for every pending store future and run its completion
    pub fn sync(&self) -> Result<(), BrokerError> {
        debug!(channel = %self.id, "sync() called on channel");
        let result = self.pending.sync();
        if self.credit.is_limited() {
            self.deliver_to_consumers();
        }
        result
    }

    /// All frames of the current batch have been received
    pub fn receive_complete(&self) -> Result<(), BrokerError> {
        self.sync()
    }

    /// Check the open transaction against the time limits, closing the
    /// connection when a close threshold is exceeded. Returns true if the
    /// connection was closed.
    pub fn check_transaction_status(&self, timeouts: &TransactionTimeouts) -> bool {
        let reason = {
            let txn = self.transaction.lock();
            self.timeout_helper
                .check(txn.get(), timeouts, Timestamp::now())
        };

        match reason {
            Some(reason) => {
                self.close_connection(&reason);
                true
            }
            None => false,
        }
    }

    fn close_connection(&self, reason: &str) {
        let _received = self.connection.received_lock().lock();
        warn!(channel = %self.id, reason, "Closing connection");
        self.connection.close(ReplyCode::ResourceError, reason);
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Start a new publish towards `router`
    pub fn set_publish_frame(
        &self,
        info: PublishInfo,
        router: Arc<dyn Router>,
    ) -> Result<(), BrokerError> {
        let security = self.connection.security_manager();
        if !security.authorise_publish(info.immediate, info.routing_key.as_deref(), router.name()) {
            return Err(BrokerError::AccessRefused {
                message: router.name().to_string(),
            });
        }

        *self.current_message.lock() = Some(IncomingMessage::new(info, router));
        Ok(())
    }

    /// Attach the content header to the message being assembled
    pub fn publish_content_header(&self, header: ContentHeader) -> Result<(), BrokerError> {
        let complete = {
            let mut current = self.current_message.lock();
            let Some(message) = current.as_mut() else {
                return Err(BrokerError::protocol_sequence(
                    "Received content header without previously receiving a BasicPublish frame",
                ));
            };

            debug!(channel = %self.id, body_size = header.body_size, "Content header received");
            if let Err(e) = message.set_header(header) {
                *current = None;
                return Err(e);
            }

            if message.is_complete() {
                current.take()
            } else {
                None
            }
        };

        match complete {
            Some(message) => self.deliver_current_message(message),
            None => Ok(()),
        }
    }

    /// Append a body chunk, routing the message once the body is complete
    pub fn publish_content_body(&self, chunk: Bytes) -> Result<(), BrokerError> {
        let complete = {
            let mut current = self.current_message.lock();
            let Some(message) = current.as_mut() else {
                return Err(BrokerError::protocol_sequence(
                    "Received content body without previously receiving a Content Header",
                ));
            };

            debug!(channel = %self.id, length = chunk.len(), "Content body received");
            if let Err(e) = message.add_body(chunk) {
                *current = None;
                return Err(e);
            }

            if message.is_complete() {
                current.take()
            } else {
                None
            }
        };

        match complete {
            Some(message) => self.deliver_current_message(message),
            None => Ok(()),
        }
    }

    /// Whether a publish is partly assembled
    pub fn has_current_message(&self) -> bool {
        self.current_message.lock().is_some()
    }

    fn deliver_current_message(&self, incoming: IncomingMessage) -> Result<(), BrokerError> {
        let description = incoming.description();
        let (publish_info, header, router, chunks) = incoming.into_parts();
        let Some(header) = header else {
            return Err(BrokerError::protocol_sequence(
                "Message completed without a content header",
            ));
        };

        let metadata = MessageMetaData {
            publish_info,
            header,
            arrival_time: self.connection.last_received_time(),
        };

        let stored = self.store.add_message(&metadata)?;
        let mut offset = 0;
        for chunk in &chunks {
            stored.add_content(offset, chunk)?;
            offset += chunk.len();
        }
        let message = Arc::new(ServerMessage::new(metadata, Arc::clone(&stored)));

        let mut txn = self.transaction.lock();
        let txn = txn.get_mut();

        if !self.check_message_user_id(&message) {
            return txn.add_post_transaction_action(Box::new(WriteReturnAction::new(
                self.output(),
                self.id,
                message,
                ReplyCode::AccessRefused,
                "Access Refused",
            )));
        }

        let properties = InstanceProperties::for_publish(&message);
        let callback = if message.is_immediate() {
            actions::immediate_callback(self.self_ref.clone())
        } else {
            actions::capacity_check_callback(self.self_ref.clone())
        };

        let enqueues = router.send(&message, properties, txn, Some(callback))?;
        if enqueues == 0 {
            return self.handle_unroutable_message(&message, &description, txn);
        }

        if txn.is_transactional() {
            self.stats.work_joined();
        }
        // Durability of the routed enqueues is tracked by the store commits.
        drop(stored.flush_to_store());
        Ok(())
    }

    fn check_message_user_id(&self, message: &ServerMessage) -> bool {
        if !self.config.message_authorization_required {
            return true;
        }
        match &message.header().properties.user_id {
            Some(user_id) => {
                self.connection.authorized_principal().as_deref() == Some(user_id.as_str())
            }
            None => true,
        }
    }

    fn handle_unroutable_message(
        &self,
        message: &Arc<ServerMessage>,
        description: &str,
        txn: &mut dyn ServerTransaction,
    ) -> Result<(), BrokerError> {
        let mandatory = message.is_mandatory();
        let close_on_no_route = self.connection.close_when_no_route();

        debug!(
            channel = %self.id,
            message = description,
            mandatory,
            transactional = txn.is_transactional(),
            close_on_no_route,
            "Unroutable message"
        );

        if mandatory && txn.is_transactional() && close_on_no_route {
            return Err(BrokerError::NoRoute {
                description: description.to_string(),
            });
        }

        if mandatory || message.is_immediate() {
            return txn.add_post_transaction_action(Box::new(WriteReturnAction::new(
                self.output(),
                self.id,
                Arc::clone(message),
                ReplyCode::NoRoute,
                format!("No Route for message {}", description),
            )));
        }

        let info = message.publish_info();
        info!(
            exchange = %info.exchange,
            routing_key = info.routing_key.as_deref().unwrap_or("null"),
            "Discarded message: no route"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------------

    /// Attach a consumer to `queue`. A tag is generated when none is given.
    pub fn subscribe_to_queue(
        &self,
        tag: Option<ConsumerTag>,
        queue: &Arc<Queue>,
        mode: ConsumerMode,
        exclusive: bool,
    ) -> Result<ConsumerTag, BrokerError> {
        if self.is_closing() {
            return Err(BrokerError::ChannelClosing {
                channel_id: self.id.value(),
            });
        }
        let Some(channel) = self.self_ref.upgrade() else {
            return Err(BrokerError::ChannelClosing {
                channel_id: self.id.value(),
            });
        };

        let tag = tag.unwrap_or_else(|| {
            ConsumerTag::generated(self.consumer_sequence.fetch_add(1, Ordering::SeqCst) + 1)
        });

        let subscription = {
            let mut consumers = self.consumers.lock();
            if consumers.contains_key(&tag) {
                return Err(BrokerError::DuplicateConsumerTag { tag });
            }

            let target = Arc::new(ConsumerTarget::new(mode, tag.clone(), &channel));
            let subscription =
                queue.register_subscription(target, mode.subscription_options(exclusive))?;
            consumers.insert(tag.clone(), Arc::clone(&subscription));
            subscription
        };

        info!(
            channel = %self.id,
            consumer_tag = %tag,
            queue = %queue.name(),
            mode = ?mode,
            "Consumer subscribed",
        );
        queue.attempt_delivery(&subscription);
        Ok(tag)
    }

    /// Detach a consumer. Returns false if the tag is not registered.
    pub fn unsubscribe_consumer(&self, tag: &ConsumerTag) -> bool {
        let removed = self.consumers.lock().remove(tag);
        match removed {
            Some(subscription) => {
                subscription.close();
                info!(channel = %self.id, consumer_tag = %tag, "Consumer unsubscribed");
                true
            }
            None => {
                warn!(
                    channel = %self.id,
                    consumer_tag = %tag,
                    "Attempt to unsubscribe consumer which is not registered"
                );
                false
            }
        }
    }

    fn unsubscribe_all_consumers(&self) {
        let consumers: Vec<_> = self.consumers.lock().drain().collect();
        if consumers.is_empty() {
            info!(channel = %self.id, "No consumers to unsubscribe on channel");
            return;
        }

        info!(
            channel = %self.id,
            count = consumers.len(),
            "Unsubscribing all consumers on channel",
        );
        for (tag, subscription) in consumers {
            debug!(channel = %self.id, consumer_tag = %tag, "Unsubscribing consumer");
            subscription.close();
        }
    }

    /// Apply new prefetch limits and restart delivery if credit was freed
    pub fn set_credit(&self, prefetch_size: u64, prefetch_count: u32) {
        info!(channel = %self.id, prefetch_size, prefetch_count, "Prefetch size changed");
        if self.credit.set_credit_limits(prefetch_size, prefetch_count) {
            self.deliver_to_consumers();
        }
    }

    /// Run synchronous delivery for every consumer of this channel
    fn deliver_to_consumers(&self) {
        for subscription in self.subscriptions() {
            if let Some(queue) = subscription.queue() {
                queue.attempt_delivery(&subscription);
            }
        }
    }

    /// Ask each consumer's queue to deliver from its background task
    fn kick_consumers(&self) {
        for subscription in self.subscriptions() {
            subscription.external_state_change();
        }
    }

    fn quiesce(&self) -> Generation {
        self.barrier.drain(self.subscriptions().iter())
    }

    // ------------------------------------------------------------------------
    // Delivery bookkeeping
    // ------------------------------------------------------------------------

    /// Record an acknowledged-mode delivery and return its tag
    pub(crate) fn record_delivery(
        &self,
        instance: Arc<MessageInstance>,
        subscription: Arc<Subscription>,
    ) -> DeliveryTag {
        let mut ledger = self.ledger.lock();
        let tag = ledger.next_tag();
        debug!(
            channel = %self.id,
            delivery_tag = %tag,
            message_number = instance.message().message_number(),
            subscription = %subscription.id(),
            "Adding unacked message"
        );
        ledger.unacked.add(tag, instance, subscription);
        tag
    }

    /// Allocate a tag for a delivery that is not recorded
    pub(crate) fn next_delivery_tag(&self) -> DeliveryTag {
        self.ledger.lock().next_tag()
    }

    pub(crate) fn write_delivery(
        &self,
        consumer_tag: &ConsumerTag,
        delivery_tag: DeliveryTag,
        instance: &MessageInstance,
    ) {
        self.output.write_deliver(
            self.id,
            crate::collaborators::Delivery {
                consumer_tag: consumer_tag.clone(),
                delivery_tag,
                redelivered: instance.is_redelivered(),
                delivery_count: instance.delivery_count(),
                message: Arc::clone(instance.message()),
            },
        );
    }

    fn release_entry(&self, entry: &UnackedEntry) {
        entry.instance.set_redelivered();
        self.credit.restore(1, entry.instance.message().size());
        entry.instance.release();
    }

    // ------------------------------------------------------------------------
    // Acknowledgement, requeue and resend
    // ------------------------------------------------------------------------

    /// Acknowledge one delivery, or every delivery up to `tag` when
    /// `multiple` is set. Unknown tags are logged and ignored.
    pub fn acknowledge_message(&self, tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        let acked = self.ledger.lock().unacked.acknowledge(tag, multiple);
        if acked.is_empty() {
            warn!(
                channel = %self.id,
                delivery_tag = %tag,
                multiple,
                "Acknowledgement for unknown delivery tag",
            );
            return Ok(());
        }

        let instances: Vec<_> = acked.into_iter().map(|entry| entry.instance).collect();
        debug!(
            channel = %self.id,
            delivery_tag = %tag,
            multiple,
            count = instances.len(),
            "Acknowledging messages",
        );

        {
            let mut txn = self.transaction.lock();
            let ack = AcknowledgeAction::new(
                instances.clone(),
                Arc::clone(&self.credit),
                Arc::clone(&self.resend_list),
                Arc::clone(&self.rolling_back),
            );
            txn.get_mut().dequeue(&instances, Box::new(ack))?;
            if txn.get().is_transactional() {
                self.stats.work_joined();
            }
        }

        if self.credit.is_limited() {
            self.deliver_to_consumers();
        }
        Ok(())
    }

    /// Release every unacknowledged delivery for redelivery to any consumer
    pub fn requeue(&self) {
        let entries = self.ledger.lock().unacked.cancel_all();
        if !entries.is_empty() {
            info!(channel = %self.id, count = entries.len(), "Requeuing unacked messages");
        }

        for entry in &entries {
            self.release_entry(entry);
        }
    }

    /// Release a single delivery
    pub fn requeue_tag(&self, tag: DeliveryTag) -> bool {
        let removed = self.ledger.lock().unacked.remove(tag);
        match removed {
            Some(entry) => {
                self.release_entry(&entry);
                true
            }
            None => {
                warn!(
                    channel = %self.id,
                    delivery_tag = %tag,
                    "Requested requeue of message but no such delivery tag exists"
                );
                false
            }
        }
    }

    /// Whether the queue of the message under `tag` limits deliveries
    pub fn is_max_delivery_count_enabled(&self, tag: DeliveryTag) -> bool {
        self.ledger
            .lock()
            .unacked
            .get(tag)
            .is_some_and(|entry| entry.instance.maximum_delivery_count() > 0)
    }

    /// Whether the message under `tag` reached its queue's delivery limit
    pub fn is_delivered_too_many_times(&self, tag: DeliveryTag) -> bool {
        self.ledger.lock().unacked.get(tag).is_some_and(|entry| {
            let maximum = entry.instance.maximum_delivery_count();
            maximum != 0 && entry.instance.delivery_count() >= maximum
        })
    }

    /// Redeliver outstanding deliveries to the consumers that hold them.
    ///
    /// Deliveries whose consumer is gone are released when
    /// `requeue_unresendable` is set and discarded otherwise. A resend that
    /// fails is released instead.
    pub fn resend(&self, requeue_unresendable: bool) -> Result<(), BrokerError> {
        let partitioned = self.ledger.lock().unacked.visit(|_, entry| {
            let live = !entry.subscription.is_closed()
                && entry.instance.is_acquired_by(entry.subscription.id());
            if live {
                Disposition::Resend
            } else if requeue_unresendable {
                Disposition::Requeue
            } else {
                Disposition::Discard
            }
        });

        debug!(
            channel = %self.id,
            resend = partitioned.resend.len(),
            requeue = partitioned.requeue.len(),
            discard = partitioned.discard.len(),
            "Resending unacknowledged messages"
        );

        let mut failed = Vec::new();
        for (tag, entry) in partitioned.resend {
            // The client never saw this delivery.
            entry.instance.decrement_delivery_count();
            entry.instance.set_redelivered();
            if !entry.instance.resend() {
                failed.push((tag, entry));
            }
        }

        if !partitioned.requeue.is_empty() || !failed.is_empty() {
            info!(
                channel = %self.id,
                count = partitioned.requeue.len() + failed.len(),
                "Requeuing messages that cannot be resent"
            );
        }

        for (_, entry) in &partitioned.requeue {
            entry.instance.decrement_delivery_count();
            self.release_entry(entry);
        }
        for (_, entry) in &failed {
            self.release_entry(entry);
        }

        let mut outcome = Ok(());
        for (tag, entry) in partitioned.discard {
            self.credit.restore(1, entry.instance.message().size());
            let discarded = Arc::clone(&entry.instance);
            let mut txn = AutoCommitTransaction::new(Arc::clone(&self.store));
            let result = txn.dequeue(
                std::slice::from_ref(&entry.instance),
                action(
                    move || {
                        discarded.delete();
                        Ok(())
                    },
                    || {},
                ),
            );
            if let Err(e) = result {
                error!(
                    channel = %self.id,
                    delivery_tag = %tag,
                    error = %e,
                    "Failed to discard message",
                );
                outcome = outcome.and(Err(e));
            }
        }
        outcome
    }

    /// Reject a delivery. With `requeue` the message is released, unless it
    /// has reached its maximum delivery count; otherwise, and when it has,
    /// it is dead-lettered.
    pub fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let entry = self.ledger.lock().unacked.get(tag).cloned();
        let Some(entry) = entry else {
            warn!(channel = %self.id, delivery_tag = %tag, "Reject for unknown delivery tag");
            return Ok(());
        };

        entry.instance.reject(entry.subscription.id());
        debug!(channel = %self.id, delivery_tag = %tag, requeue, "Rejecting message");

        if requeue && !self.is_delivered_too_many_times(tag) {
            self.requeue_tag(tag);
            Ok(())
        } else {
            self.dead_letter(tag)
        }
    }

    /// Route a delivery to its queue's alternate exchange, discarding it if
    /// that reaches no queue
    pub fn dead_letter(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let removed = self.ledger.lock().unacked.remove(tag);
        let Some(entry) = removed else {
            warn!(
                channel = %self.id,
                delivery_tag = %tag,
                "No message found, unable to DLQ delivery tag",
            );
            return Ok(());
        };

        self.credit.restore(1, entry.instance.message().size());
        let message_number = entry.instance.message().message_number();
        let channel_id = self.id;
        let logged: crate::collaborators::EnqueueCallback =
            Arc::new(move |requeued: &Arc<MessageInstance>| {
                let destination = requeued
                    .owning_queue()
                    .map(|queue| queue.name().to_string())
                    .unwrap_or_default();
                info!(
                    channel = %channel_id,
                    message_number,
                    queue = %destination,
                    "Message dead-lettered",
                );
            });

        let requeues = match entry.instance.route_to_alternate(Some(logged), None) {
            Ok(requeues) => requeues,
            Err(e) => {
                error!(
                    channel = %self.id,
                    delivery_tag = %tag,
                    error = %e,
                    "Dead-lettering failed, releasing message",
                );
                entry.instance.set_redelivered();
                entry.instance.release();
                return Err(e);
            }
        };
        if requeues > 0 {
            return Ok(());
        }

        if let Some(queue) = entry.instance.owning_queue() {
            match queue.alternate_exchange() {
                None => info!(
                    channel = %self.id,
                    message_number,
                    queue = %queue.name(),
                    routing_key = entry.instance.message().routing_key().unwrap_or("null"),
                    "Discarded message: no alternate exchange configured for queue"
                ),
                Some(alternate) => info!(
                    channel = %self.id,
                    message_number,
                    exchange = alternate.name(),
                    "Discarded message: alternate exchange routed to no queues"
                ),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flow
    // ------------------------------------------------------------------------

    /// Client-requested flow change (channel.flow)
    pub fn set_suspended(&self, suspended: bool) {
        let changed = {
            let _op = self.op_lock.lock();
            let was_suspended = self.suspended.swap(suspended, Ordering::SeqCst);
            if was_suspended == suspended {
                false
            } else {
                if suspended {
                    self.quiesce();
                    info!(channel = %self.id, "Flow Stopped");
                } else {
                    info!(channel = %self.id, "Flow Started");
                }
                true
            }
        };

        if changed && !suspended {
            self.deliver_to_consumers();
        }
    }

    /// Hold back the whole channel
    pub fn block(&self) {
        self.add_blocker(BlockingEntity::Channel, ALL_QUEUES);
    }

    /// Lift flow control from every queue blocking this channel
    pub fn unblock(&self) {
        self.remove_blocker(BlockingEntity::Channel);
    }

    /// Hold back the channel on behalf of an over-full queue
    pub fn block_queue(&self, queue: &Queue) {
        self.add_blocker(BlockingEntity::Queue(queue.name().clone()), queue.name().as_str());
    }

    /// Lift flow control imposed by `queue`
    pub fn unblock_queue(&self, queue: &Queue) {
        self.remove_blocker(BlockingEntity::Queue(queue.name().clone()));
    }

    fn add_blocker(&self, entity: BlockingEntity, label: &str) {
        let became_blocked = {
            let mut entities = self.blocking_entities.lock();
            entities.insert(entity)
                && self
                    .blocking
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
        };

        if became_blocked {
            info!(channel = %self.id, queue = label, "Flow enforced");
            self.output.write_flow(self.id, false);
            self.quiesce();
        }
    }

    fn remove_blocker(&self, entity: BlockingEntity) {
        let per_queue = matches!(entity, BlockingEntity::Queue(_));
        let cleared = {
            let mut entities = self.blocking_entities.lock();
            entities.remove(&entity)
                && entities.is_empty()
                && self
                    .blocking
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
        };

        if cleared && !(per_queue && self.is_closing()) {
            info!(channel = %self.id, "Flow removed");
            self.output.write_flow(self.id, true);
            self.kick_consumers();
        }
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close every subscription and requeue all unacknowledged messages
    pub fn close(&self) {
        self.close_channel(None);
    }

    /// Close with a reason reported in the forced-close log event
    pub fn close_with(&self, code: ReplyCode, reason: &str) {
        self.close_channel(Some((code, reason)));
    }

    fn close_channel(&self, cause: Option<(ReplyCode, &str)>) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let _op = self.op_lock.lock();
        match cause {
            None => info!(channel = %self.id, "Channel closed"),
            Some((code, reason)) => warn!(
                channel = %self.id,
                code = %code,
                reason,
                "Channel forcibly closed",
            ),
        }

        *self.current_message.lock() = None;
        self.unsubscribe_all_consumers();

        {
            let mut txn = self.transaction.lock();
            if let Err(e) = txn.get_mut().rollback() {
                error!(channel = %self.id, error = %e, "Rollback during close failed");
            }
        }

        self.requeue();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("closing", &self.is_closing())
            .field("suspended", &self.suspended.load(Ordering::SeqCst))
            .field("blocking", &self.is_blocking())
            .finish()
    }
}
