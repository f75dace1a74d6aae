//! Units of work over queue enqueues and dequeues.
//!
//! Every enqueue, dequeue or standalone action registers a
//! [`TransactionAction`]. When the unit of work ends, exactly one of the
//! action's callbacks runs, exactly once: `post_commit` after the work is
//! durable, `on_rollback` otherwise. Consuming `Box<Self>` makes a second
//! callback impossible.
//!
//! Three flavours exist:
//!
//! - [`AutoCommitTransaction`] commits every operation on its own, waiting
//!   for the store.
//! - [`AsyncAutoCommitTransaction`] commits every operation on its own but
//!   hands slow store commits to a [`PendingCommands`] queue that the channel
//!   drains in `sync`.
//! - [`LocalTransaction`] buffers everything until `commit` or `rollback`.

use crate::error::{BrokerError, StoreError};
use crate::instance::MessageInstance;
use crate::message::{ServerMessage, Timestamp};
use crate::queue::Queue;
use crate::store::{ImmediateStoreFuture, MessageStore, StoreFuture, StoreTransaction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;

// ============================================================================
// Actions
// ============================================================================

/// Deferred work bound to the outcome of a transaction
pub trait TransactionAction: Send {
    fn post_commit(self: Box<Self>) -> Result<(), BrokerError>;

    fn on_rollback(self: Box<Self>);
}

struct FnAction<C, R> {
    commit: C,
    rollback: R,
}

impl<C, R> TransactionAction for FnAction<C, R>
where
    C: FnOnce() -> Result<(), BrokerError> + Send,
    R: FnOnce() + Send,
{
    fn post_commit(self: Box<Self>) -> Result<(), BrokerError> {
        (self.commit)()
    }

    fn on_rollback(self: Box<Self>) {
        (self.rollback)()
    }
}

/// Build an action from a pair of closures
pub fn action<C, R>(commit: C, rollback: R) -> Box<dyn TransactionAction>
where
    C: FnOnce() -> Result<(), BrokerError> + Send + 'static,
    R: FnOnce() + Send + 'static,
{
    Box::new(FnAction { commit, rollback })
}

/// Run post-commit callbacks in order. Every action runs even when an
/// earlier one fails; the first failure is returned.
fn run_post_commit(
    actions: impl IntoIterator<Item = Box<dyn TransactionAction>>,
) -> Result<(), BrokerError> {
    let mut failure = None;
    for action in actions {
        if let Err(e) = action.post_commit() {
            error!(error = %e, "Post-commit action failed");
            failure.get_or_insert(e);
        }
    }

    match failure {
        None => Ok(()),
        Some(e @ BrokerError::ActionFailed { .. }) => Err(e),
        Some(e) => Err(BrokerError::ActionFailed { message: e.to_string() }),
    }
}

fn run_rollback(actions: impl IntoIterator<Item = Box<dyn TransactionAction>>) {
    for action in actions {
        action.on_rollback();
    }
}

/// Whether an enqueue or dequeue must be recorded by the store
fn needs_store(queue: &Queue, message: &ServerMessage) -> bool {
    queue.is_durable() && message.is_persistent()
}

// ============================================================================
// Transaction Contract
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

pub trait ServerTransaction: Send {
    fn is_transactional(&self) -> bool;

    fn state(&self) -> TransactionState;

    /// When the first piece of work joined the open transaction
    fn start_time(&self) -> Option<Timestamp>;

    /// When work last joined the open transaction
    fn update_time(&self) -> Option<Timestamp>;

    fn add_post_transaction_action(
        &mut self,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError>;

    /// Remove instances from their queues. The instances themselves are
    /// changed only by `action`.
    fn dequeue(
        &mut self,
        instances: &[Arc<MessageInstance>],
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError>;

    /// Place a message on a queue. `action` performs the actual enqueue.
    fn enqueue(
        &mut self,
        queue: &Arc<Queue>,
        message: &Arc<ServerMessage>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError>;

    fn commit(&mut self, immediate: Option<Box<dyn FnOnce() + Send>>) -> Result<(), BrokerError>;

    fn rollback(&mut self) -> Result<(), BrokerError>;
}

// ============================================================================
// Auto-Commit
// ============================================================================

/// Commits every operation as it is made
pub struct AutoCommitTransaction {
    store: Arc<dyn MessageStore>,
}

impl AutoCommitTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    fn complete(
        &self,
        store_txn: Option<Box<dyn StoreTransaction>>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        if let Some(txn) = store_txn {
            if let Err(e) = txn.commit_async().wait_for_completion() {
                action.on_rollback();
                return Err(e.into());
            }
        }
        run_post_commit([action])
    }
}

impl ServerTransaction for AutoCommitTransaction {
    fn is_transactional(&self) -> bool {
        false
    }

    fn state(&self) -> TransactionState {
        TransactionState::Active
    }

    fn start_time(&self) -> Option<Timestamp> {
        None
    }

    fn update_time(&self) -> Option<Timestamp> {
        None
    }

    fn add_post_transaction_action(
        &mut self,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        run_post_commit([action])
    }

    fn dequeue(
        &mut self,
        instances: &[Arc<MessageInstance>],
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        match record_dequeues(&*self.store, None, instances) {
            Ok(store_txn) => self.complete(store_txn, action),
            Err(e) => Err(refuse(e, action)),
        }
    }

    fn enqueue(
        &mut self,
        queue: &Arc<Queue>,
        message: &Arc<ServerMessage>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        match record_enqueue(&*self.store, None, queue, message) {
            Ok(store_txn) => self.complete(store_txn, action),
            Err(e) => Err(refuse(e, action)),
        }
    }

    fn commit(&mut self, immediate: Option<Box<dyn FnOnce() + Send>>) -> Result<(), BrokerError> {
        if let Some(immediate) = immediate {
            immediate();
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn record_dequeues(
    store: &dyn MessageStore,
    mut store_txn: Option<Box<dyn StoreTransaction>>,
    instances: &[Arc<MessageInstance>],
) -> Result<Option<Box<dyn StoreTransaction>>, StoreError> {
    for instance in instances {
        let Some(queue) = instance.owning_queue() else {
            continue;
        };
        let message = instance.message();
        if needs_store(&queue, message) {
            let txn = store_txn.get_or_insert_with(|| store.begin_transaction());
            if let Err(e) = txn.dequeue_message(queue.name(), message.message_number()) {
                abort(store_txn);
                return Err(e);
            }
        }
    }
    Ok(store_txn)
}

fn record_enqueue(
    store: &dyn MessageStore,
    mut store_txn: Option<Box<dyn StoreTransaction>>,
    queue: &Queue,
    message: &ServerMessage,
) -> Result<Option<Box<dyn StoreTransaction>>, StoreError> {
    if needs_store(queue, message) {
        let txn = store_txn.get_or_insert_with(|| store.begin_transaction());
        if let Err(e) = txn.enqueue_message(queue.name(), message.message_number()) {
            abort(store_txn);
            return Err(e);
        }
    }
    Ok(store_txn)
}

fn abort(store_txn: Option<Box<dyn StoreTransaction>>) {
    if let Some(txn) = store_txn {
        txn.abort();
    }
}

/// An operation the store refused never happened: roll its action back
fn refuse(error: StoreError, action: Box<dyn TransactionAction>) -> BrokerError {
    error!(error = %error, "Store refused auto-commit operation");
    action.on_rollback();
    BrokerError::Store(error)
}

// ============================================================================
// Pending Async Commands
// ============================================================================

struct AsyncCommand {
    future: Box<dyn StoreFuture>,
    action: Box<dyn TransactionAction>,
}

/// Store futures whose completion actions have not run yet, in order
#[derive(Clone, Default)]
pub struct PendingCommands {
    queue: Arc<Mutex<VecDeque<AsyncCommand>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `action` until `future` completes
    pub fn record(&self, future: Box<dyn StoreFuture>, action: Box<dyn TransactionAction>) {
        self.queue.lock().push_back(AsyncCommand { future, action });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wait for every recorded future in order and run its action.
    ///
    /// A failed future runs the action's rollback instead; the first failure
    /// is returned once the queue is drained.
    pub fn sync(&self) -> Result<(), BrokerError> {
        let mut failure = None;
        loop {
            let Some(command) = self.queue.lock().pop_front() else {
                break;
            };

            let outcome = match command.future.wait_for_completion() {
                Ok(()) => run_post_commit([command.action]),
                Err(e) => {
                    command.action.on_rollback();
                    Err(BrokerError::Store(e))
                }
            };

            if let Err(e) = outcome {
                error!(error = %e, "Pending store command failed");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Auto-commit transaction that does not wait for the store.
///
/// Work whose store commit has not completed is recorded with the
/// [`PendingCommands`] queue. Work that needs no store commit runs at once
/// unless earlier work is still pending, in which case it queues behind it
/// to keep completion order.
pub struct AsyncAutoCommitTransaction {
    store: Arc<dyn MessageStore>,
    pending: PendingCommands,
}

impl AsyncAutoCommitTransaction {
    pub fn new(store: Arc<dyn MessageStore>, pending: PendingCommands) -> Self {
        Self { store, pending }
    }

    fn complete(
        &self,
        store_txn: Option<Box<dyn StoreTransaction>>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        let future: Box<dyn StoreFuture> = match store_txn {
            Some(txn) => txn.commit_async(),
            None => Box::new(ImmediateStoreFuture::ok()),
        };

        if self.pending.is_empty() && future.is_complete() {
            run_post_commit([action])
        } else {
            self.pending.record(future, action);
            Ok(())
        }
    }
}

impl ServerTransaction for AsyncAutoCommitTransaction {
    fn is_transactional(&self) -> bool {
        false
    }

    fn state(&self) -> TransactionState {
        TransactionState::Active
    }

    fn start_time(&self) -> Option<Timestamp> {
        None
    }

    fn update_time(&self) -> Option<Timestamp> {
        None
    }

    fn add_post_transaction_action(
        &mut self,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        self.complete(None, action)
    }

    fn dequeue(
        &mut self,
        instances: &[Arc<MessageInstance>],
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        match record_dequeues(&*self.store, None, instances) {
            Ok(store_txn) => self.complete(store_txn, action),
            Err(e) => Err(refuse(e, action)),
        }
    }

    fn enqueue(
        &mut self,
        queue: &Arc<Queue>,
        message: &Arc<ServerMessage>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        match record_enqueue(&*self.store, None, queue, message) {
            Ok(store_txn) => self.complete(store_txn, action),
            Err(e) => Err(refuse(e, action)),
        }
    }

    fn commit(&mut self, immediate: Option<Box<dyn FnOnce() + Send>>) -> Result<(), BrokerError> {
        if let Some(immediate) = immediate {
            immediate();
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

// ============================================================================
// Local Transactions
// ============================================================================

/// Source of the activity time stamped on transactional work
pub type ActivityClock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Client-demarcated transaction. One-shot: after commit or rollback a new
/// transaction must be started.
pub struct LocalTransaction {
    store: Arc<dyn MessageStore>,
    store_txn: Option<Box<dyn StoreTransaction>>,
    actions: Vec<Box<dyn TransactionAction>>,
    state: TransactionState,
    clock: ActivityClock,
    start_time: Option<Timestamp>,
    update_time: Option<Timestamp>,
}

impl LocalTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_activity_clock(store, Arc::new(Timestamp::now))
    }

    pub fn with_activity_clock(store: Arc<dyn MessageStore>, clock: ActivityClock) -> Self {
        Self {
            store,
            store_txn: None,
            actions: Vec::new(),
            state: TransactionState::Active,
            clock,
            start_time: None,
            update_time: None,
        }
    }

    /// Number of registered actions
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    fn ensure_active(&self) -> Result<(), BrokerError> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(BrokerError::TransactionState { state: state.to_string() }),
        }
    }

    fn touch(&mut self) {
        let now = (self.clock)();
        self.start_time.get_or_insert(now);
        self.update_time = Some(now);
    }

    fn fail_store(&mut self, error: StoreError) -> BrokerError {
        error!(error = %error, "Store operation failed inside local transaction");
        self.state = TransactionState::RolledBack;
        if let Some(txn) = self.store_txn.take() {
            txn.abort();
        }
        run_rollback(self.actions.drain(..));
        BrokerError::Store(error)
    }

    /// Start the store commit without waiting for it.
    ///
    /// The returned handle finishes the transaction: waiting on it runs the
    /// post-commit actions and then `on_complete`, or the rollback actions if
    /// the store commit failed.
    pub fn commit_async(
        &mut self,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<CommitHandle, BrokerError> {
        self.ensure_active()?;
        self.state = TransactionState::Committed;

        let future: Box<dyn StoreFuture> = match self.store_txn.take() {
            Some(txn) => txn.commit_async(),
            None => Box::new(ImmediateStoreFuture::ok()),
        };

        Ok(CommitHandle {
            future,
            actions: std::mem::take(&mut self.actions),
            on_complete,
        })
    }
}

impl ServerTransaction for LocalTransaction {
    fn is_transactional(&self) -> bool {
        true
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    fn update_time(&self) -> Option<Timestamp> {
        self.update_time
    }

    fn add_post_transaction_action(
        &mut self,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        self.ensure_active()?;
        self.touch();
        self.actions.push(action);
        Ok(())
    }

    fn dequeue(
        &mut self,
        instances: &[Arc<MessageInstance>],
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        self.ensure_active()?;
        self.touch();
        self.actions.push(action);

        match record_dequeues(&*self.store, self.store_txn.take(), instances) {
            Ok(txn) => {
                self.store_txn = txn;
                Ok(())
            }
            Err(e) => Err(self.fail_store(e)),
        }
    }

    fn enqueue(
        &mut self,
        queue: &Arc<Queue>,
        message: &Arc<ServerMessage>,
        action: Box<dyn TransactionAction>,
    ) -> Result<(), BrokerError> {
        self.ensure_active()?;
        self.touch();
        self.actions.push(action);

        match record_enqueue(&*self.store, self.store_txn.take(), queue, message) {
            Ok(txn) => {
                self.store_txn = txn;
                Ok(())
            }
            Err(e) => Err(self.fail_store(e)),
        }
    }

    fn commit(&mut self, immediate: Option<Box<dyn FnOnce() + Send>>) -> Result<(), BrokerError> {
        self.ensure_active()?;

        if let Some(txn) = self.store_txn.take() {
            if let Err(e) = txn.commit_async().wait_for_completion() {
                return Err(self.fail_store(e));
            }
        }

        self.state = TransactionState::Committed;
        debug!(actions = self.actions.len(), "Committing local transaction");
        let result = run_post_commit(self.actions.drain(..));
        if let Some(immediate) = immediate {
            immediate();
        }
        result
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        self.ensure_active()?;
        self.state = TransactionState::RolledBack;

        if let Some(txn) = self.store_txn.take() {
            txn.abort();
        }

        debug!(actions = self.actions.len(), "Rolling back local transaction");
        run_rollback(self.actions.drain(..));
        Ok(())
    }
}

/// Completion of an asynchronous local commit
pub struct CommitHandle {
    future: Box<dyn StoreFuture>,
    actions: Vec<Box<dyn TransactionAction>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl CommitHandle {
    pub fn is_complete(&self) -> bool {
        self.future.is_complete()
    }

    /// Block until the store commit finishes and run the outcome's actions
    pub fn wait(self) -> Result<(), BrokerError> {
        let (future, action) = self.into_parts();
        match future.wait_for_completion() {
            Ok(()) => action.post_commit(),
            Err(e) => {
                action.on_rollback();
                Err(BrokerError::Store(e))
            }
        }
    }

    /// Split into the store future and one action covering the outcome, for
    /// recording with [`PendingCommands`]
    pub fn into_parts(self) -> (Box<dyn StoreFuture>, Box<dyn TransactionAction>) {
        let actions = self.actions;
        let on_complete = self.on_complete;
        (self.future, Box::new(CommitOutcome { actions, on_complete }))
    }
}

struct CommitOutcome {
    actions: Vec<Box<dyn TransactionAction>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl TransactionAction for CommitOutcome {
    fn post_commit(self: Box<Self>) -> Result<(), BrokerError> {
        let result = run_post_commit(self.actions);
        if let Some(on_complete) = self.on_complete {
            on_complete();
        }
        result
    }

    fn on_rollback(self: Box<Self>) {
        run_rollback(self.actions);
    }
}
