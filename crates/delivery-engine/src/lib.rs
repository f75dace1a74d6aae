//! # Delivery Engine
//!
//! Message delivery and acknowledgement core for an AMQP 0-8/0-9 style
//! broker.
//!
//! The engine takes published messages from a channel, routes them onto
//! queues, delivers queue entries to consumers under prefetch credit, and
//! settles every delivery through acknowledgement, reject, requeue,
//! dead-lettering or expiry. Local transactions defer all of that work until
//! commit and undo it on rollback.
//!
//! ## Architecture
//!
//! - [`queue::Queue`] owns an ordered [`entry_list::EntryList`] of
//!   [`instance::MessageInstance`]s and a set of [`subscription::Subscription`]s.
//! - [`channel::Channel`] is the per-session orchestrator: publish assembly,
//!   consumers, the unacknowledged map, transactions, flow and close.
//! - Routing, security, the connection and frame output are collaborators
//!   supplied by the embedding broker (see [`collaborators`]).
//! - Persistence goes through the [`store::MessageStore`] abstraction.
//!
//! ## Usage
//!
//! ```rust
//! use delivery_engine::{InMemoryMessageStore, MessageStore, Queue, QueueName};
//! use std::sync::Arc;
//!
//! let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
//! let queue = Queue::builder(QueueName::new("orders")?, store)
//!     .durable(true)
//!     .maximum_delivery_count(5)
//!     .build()?;
//!
//! assert_eq!(queue.message_count(), 0);
//! # Ok::<(), delivery_engine::BrokerError>(())
//! ```

pub mod channel;
pub mod collaborators;
pub mod config;
pub mod credit;
pub mod entry_list;
pub mod error;
pub mod flow_limit;
pub mod housekeeping;
pub mod instance;
pub mod message;
pub mod queue;
pub mod quiesce;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod timeout;
pub mod transaction;
pub mod unacked;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use channel::{Channel, ConsumerMode, IncomingMessage};
pub use collaborators::{
    AllowAllSecurityManager, BindingRouter, ConnectionModel, Delivery, EnqueueCallback,
    ProtocolOutput, Router, SecurityManager,
};
pub use config::{ChannelConfig, DeliveryConfig, LoggingConfig, QueuesConfig, TransactionsConfig};
pub use credit::CreditManager;
pub use error::{BrokerError, ConfigError, ReplyCode, StoreError, ValidationError};
pub use flow_limit::FlowThresholds;
pub use housekeeping::ChannelMonitor;
pub use instance::{EntryState, MessageInstance, StateKind};
pub use message::{
    BasicProperties, ChannelId, ConsumerTag, ContentHeader, DeliveryTag, PublishInfo, QueueName,
    ServerMessage, Timestamp,
};
pub use queue::Queue;
pub use store::{InMemoryMessageStore, MessageStore};
pub use timeout::TransactionTimeouts;
pub use transaction::{LocalTransaction, ServerTransaction};

/// Standard result type for delivery engine operations
pub type BrokerResult<T> = Result<T, BrokerError>;
