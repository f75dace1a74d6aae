//! Message store collaborator.
//!
//! The engine never interprets the on-disk format. It stores a message once
//! through [`MessageStore::add_message`], streams body chunks into the
//! returned [`StoredMessage`] handle, and records durable enqueues and
//! dequeues through [`StoreTransaction`]s whose commits complete
//! asynchronously via [`StoreFuture`].
//!
//! [`InMemoryMessageStore`] is the reference implementation used by the
//! service binary and the tests. It can be told to fail or defer commits so
//! the failure paths of the engine can be exercised.

use crate::error::StoreError;
use crate::message::{MessageMetaData, QueueName};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Handle to a message held by the store
pub trait StoredMessage: Send + Sync {
    /// Store-assigned, process-unique message number
    fn message_number(&self) -> u64;

    /// Write a body chunk at the given offset
    fn add_content(&self, offset: usize, chunk: &[u8]) -> Result<(), StoreError>;

    /// Full message body
    fn content(&self) -> Bytes;

    /// Make the message durable. Only needed for persistent messages that
    /// were enqueued on at least one durable queue.
    fn flush_to_store(&self) -> Box<dyn StoreFuture>;

    /// Drop the message from the store
    fn remove(&self);
}

/// Completion signal of an asynchronous store operation
pub trait StoreFuture: Send {
    fn is_complete(&self) -> bool;

    /// Block until the operation finishes. A failed operation is never
    /// reported as complete success.
    fn wait_for_completion(&self) -> Result<(), StoreError>;
}

/// Durable enqueue/dequeue records committed as one unit
pub trait StoreTransaction: Send {
    fn enqueue_message(&mut self, queue: &QueueName, message_number: u64) -> Result<(), StoreError>;

    fn dequeue_message(&mut self, queue: &QueueName, message_number: u64) -> Result<(), StoreError>;

    fn commit_async(self: Box<Self>) -> Box<dyn StoreFuture>;

    fn abort(self: Box<Self>);
}

/// The message store collaborator
pub trait MessageStore: Send + Sync {
    fn add_message(&self, metadata: &MessageMetaData) -> Result<Arc<dyn StoredMessage>, StoreError>;

    fn begin_transaction(&self) -> Box<dyn StoreTransaction>;
}

// ============================================================================
// Futures
// ============================================================================

/// Future that is already resolved
pub struct ImmediateStoreFuture {
    result: Result<(), StoreError>,
}

impl ImmediateStoreFuture {
    pub fn ok() -> Self {
        Self { result: Ok(()) }
    }

    pub fn failed(error: StoreError) -> Self {
        Self { result: Err(error) }
    }
}

impl StoreFuture for ImmediateStoreFuture {
    fn is_complete(&self) -> bool {
        self.result.is_ok()
    }

    fn wait_for_completion(&self) -> Result<(), StoreError> {
        self.result.clone()
    }
}

struct DeferredState {
    outcome: Mutex<Option<Result<(), StoreError>>>,
    ready: Condvar,
}

/// Future completed later through its [`StoreCompletion`] handle
pub struct DeferredStoreFuture {
    state: Arc<DeferredState>,
}

/// Completes a [`DeferredStoreFuture`]. Dropping an unfired handle abandons
/// the future.
pub struct StoreCompletion {
    state: Option<Arc<DeferredState>>,
}

impl DeferredStoreFuture {
    pub fn new() -> (Self, StoreCompletion) {
        let state = Arc::new(DeferredState {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            StoreCompletion { state: Some(state) },
        )
    }
}

impl StoreFuture for DeferredStoreFuture {
    fn is_complete(&self) -> bool {
        matches!(*self.state.outcome.lock(), Some(Ok(())))
    }

    fn wait_for_completion(&self) -> Result<(), StoreError> {
        let mut outcome = self.state.outcome.lock();
        while outcome.is_none() {
            self.state.ready.wait(&mut outcome);
        }
        outcome.clone().unwrap_or(Err(StoreError::Abandoned))
    }
}

impl StoreCompletion {
    pub fn complete(mut self, result: Result<(), StoreError>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<(), StoreError>) {
        if let Some(state) = self.state.take() {
            *state.outcome.lock() = Some(result);
            state.ready.notify_all();
        }
    }
}

impl Drop for StoreCompletion {
    fn drop(&mut self) {
        self.fire(Err(StoreError::Abandoned));
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    messages: Mutex<HashMap<u64, Arc<InMemoryStoredMessage>>>,
    durable: Mutex<BTreeSet<(QueueName, u64)>>,
    fail_commits: AtomicBool,
    fail_records: AtomicBool,
    defer_commits: AtomicBool,
    pending: Mutex<Vec<(Vec<StoreOp>, StoreCompletion)>>,
}

impl StoreInner {
    fn apply(&self, ops: &[StoreOp]) {
        let mut durable = self.durable.lock();
        for op in ops {
            match op {
                StoreOp::Enqueue(queue, number) => {
                    durable.insert((queue.clone(), *number));
                }
                StoreOp::Dequeue(queue, number) => {
                    durable.remove(&(queue.clone(), *number));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum StoreOp {
    Enqueue(QueueName, u64),
    Dequeue(QueueName, u64),
}

/// Thread-safe in-memory message store
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<StoreInner>,
    next_number: Arc<AtomicU64>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent transaction commit fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent enqueue or dequeue record fail before commit
    pub fn set_fail_records(&self, fail: bool) {
        self.inner.fail_records.store(fail, Ordering::SeqCst);
    }

    /// Hold subsequent commits until [`Self::complete_pending`] is called
    pub fn set_defer_commits(&self, defer: bool) {
        self.inner.defer_commits.store(defer, Ordering::SeqCst);
    }

    /// Complete every deferred commit with the given result
    pub fn complete_pending(&self, result: Result<(), StoreError>) -> usize {
        let pending: Vec<_> = std::mem::take(&mut *self.inner.pending.lock());
        let count = pending.len();
        for (ops, completion) in pending {
            if result.is_ok() {
                self.inner.apply(&ops);
            }
            completion.complete(result.clone());
        }
        count
    }

    /// Number of messages currently held
    pub fn message_count(&self) -> usize {
        self.inner.messages.lock().len()
    }

    /// Message numbers durably recorded on a queue
    pub fn durable_messages(&self, queue: &QueueName) -> Vec<u64> {
        self.inner
            .durable
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, number)| *number)
            .collect()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn add_message(
        &self,
        metadata: &MessageMetaData,
    ) -> Result<Arc<dyn StoredMessage>, StoreError> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Arc::new(InMemoryStoredMessage {
            number,
            content: Mutex::new(Vec::with_capacity(metadata.header.body_size as usize)),
            store: Arc::downgrade(&self.inner),
        });
        self.inner.messages.lock().insert(number, Arc::clone(&message));
        debug!(message_number = number, "Message added to store");
        Ok(message)
    }

    fn begin_transaction(&self) -> Box<dyn StoreTransaction> {
        Box::new(InMemoryStoreTransaction {
            store: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }
}

struct InMemoryStoredMessage {
    number: u64,
    content: Mutex<Vec<u8>>,
    store: Weak<StoreInner>,
}

impl StoredMessage for InMemoryStoredMessage {
    fn message_number(&self) -> u64 {
        self.number
    }

    fn add_content(&self, offset: usize, chunk: &[u8]) -> Result<(), StoreError> {
        let mut content = self.content.lock();
        let end = offset + chunk.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(chunk);
        Ok(())
    }

    fn content(&self) -> Bytes {
        Bytes::copy_from_slice(&self.content.lock())
    }

    fn flush_to_store(&self) -> Box<dyn StoreFuture> {
        Box::new(ImmediateStoreFuture::ok())
    }

    fn remove(&self) {
        if let Some(store) = self.store.upgrade() {
            store.messages.lock().remove(&self.number);
        }
    }
}

struct InMemoryStoreTransaction {
    store: Arc<StoreInner>,
    ops: Vec<StoreOp>,
}

impl InMemoryStoreTransaction {
    fn check_record(&self) -> Result<(), StoreError> {
        if self.store.fail_records.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                message: "record rejected by store".to_string(),
            });
        }
        Ok(())
    }
}

impl StoreTransaction for InMemoryStoreTransaction {
    fn enqueue_message(
        &mut self,
        queue: &QueueName,
        message_number: u64,
    ) -> Result<(), StoreError> {
        self.check_record()?;
        self.ops.push(StoreOp::Enqueue(queue.clone(), message_number));
        Ok(())
    }

    fn dequeue_message(
        &mut self,
        queue: &QueueName,
        message_number: u64,
    ) -> Result<(), StoreError> {
        self.check_record()?;
        self.ops.push(StoreOp::Dequeue(queue.clone(), message_number));
        Ok(())
    }

    fn commit_async(self: Box<Self>) -> Box<dyn StoreFuture> {
        if self.store.fail_commits.load(Ordering::SeqCst) {
            return Box::new(ImmediateStoreFuture::failed(StoreError::CommitFailed {
                message: "commit rejected by store".to_string(),
            }));
        }

        if self.store.defer_commits.load(Ordering::SeqCst) {
            let (future, completion) = DeferredStoreFuture::new();
            self.store.pending.lock().push((self.ops, completion));
            return Box::new(future);
        }

        self.store.apply(&self.ops);
        Box::new(ImmediateStoreFuture::ok())
    }

    fn abort(self: Box<Self>) {}
}
