//! Error types for delivery engine operations.

use crate::message::{ConsumerTag, DeliveryTag};
use thiserror::Error;

// ============================================================================
// Reply Codes
// ============================================================================

/// AMQP reply codes reported when a channel or connection is closed, or when a
/// message is returned to its publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    NoRoute,
    NoConsumers,
    AccessRefused,
    NotFound,
    CommandInvalid,
    ResourceError,
    NotAllowed,
    InternalError,
}

impl ReplyCode {
    /// Numeric code as carried on the wire
    pub fn code(&self) -> u16 {
        match self {
            Self::NoRoute => 312,
            Self::NoConsumers => 313,
            Self::AccessRefused => 403,
            Self::NotFound => 404,
            Self::ResourceError => 506,
            Self::CommandInvalid => 503,
            Self::NotAllowed => 530,
            Self::InternalError => 541,
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// How far an error propagates.
///
/// Per-message errors are contained to the processing of that message,
/// channel errors close the channel and connection errors close the whole
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Message,
    Channel,
    Connection,
}

// ============================================================================
// Broker Errors
// ============================================================================

/// Comprehensive error type for delivery engine operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Protocol sequence error: {message}")]
    ProtocolSequence { message: String },

    #[error("Permission denied: {message}")]
    AccessRefused { message: String },

    #[error("No route for message {description}")]
    NoRoute { description: String },

    #[error("Consumer already exists with same tag: {tag}")]
    DuplicateConsumerTag { tag: ConsumerTag },

    #[error("Fatal error: {operation} called on non-transactional channel")]
    NotTransactional { operation: String },

    #[error("Transaction is no longer active: {state}")]
    TransactionState { state: String },

    #[error("Transaction action failed: {message}")]
    ActionFailed { message: String },

    #[error(
        "Cannot subscribe to queue {queue} as it already has an exclusive or existing consumer"
    )]
    ExclusiveConsumer { queue: String },

    #[error("Unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: DeliveryTag },

    #[error("Channel {channel_id} is closing")]
    ChannelClosing { channel_id: u16 },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    /// Reply code reported to the peer for this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Self::ProtocolSequence { .. } => ReplyCode::CommandInvalid,
            Self::AccessRefused { .. } => ReplyCode::AccessRefused,
            Self::NoRoute { .. } => ReplyCode::NoRoute,
            Self::DuplicateConsumerTag { .. } => ReplyCode::NotAllowed,
            Self::NotTransactional { .. } => ReplyCode::CommandInvalid,
            Self::TransactionState { .. } => ReplyCode::CommandInvalid,
            Self::ActionFailed { .. } => ReplyCode::InternalError,
            Self::ExclusiveConsumer { .. } => ReplyCode::AccessRefused,
            Self::UnknownDeliveryTag { .. } => ReplyCode::NotFound,
            Self::ChannelClosing { .. } => ReplyCode::CommandInvalid,
            Self::Store(_) => ReplyCode::InternalError,
            Self::Configuration(_) => ReplyCode::InternalError,
            Self::Validation(_) => ReplyCode::CommandInvalid,
        }
    }

    /// How far this error propagates
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::UnknownDeliveryTag { .. } => ErrorScope::Message,
            Self::DuplicateConsumerTag { .. } => ErrorScope::Channel,
            Self::ExclusiveConsumer { .. } => ErrorScope::Channel,
            Self::NotTransactional { .. } => ErrorScope::Channel,
            Self::TransactionState { .. } => ErrorScope::Channel,
            Self::ActionFailed { .. } => ErrorScope::Channel,
            Self::ChannelClosing { .. } => ErrorScope::Channel,
            Self::Validation(_) => ErrorScope::Channel,
            Self::ProtocolSequence { .. } => ErrorScope::Connection,
            Self::AccessRefused { .. } => ErrorScope::Connection,
            Self::NoRoute { .. } => ErrorScope::Connection,
            Self::Store(_) => ErrorScope::Connection,
            Self::Configuration(_) => ErrorScope::Connection,
        }
    }

    /// Check if the error must close the owning connection
    pub fn is_connection_fault(&self) -> bool {
        self.scope() == ErrorScope::Connection
    }

    pub(crate) fn protocol_sequence(message: impl Into<String>) -> Self {
        Self::ProtocolSequence {
            message: message.into(),
        }
    }
}

/// Errors raised by the message store collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Message {message_number} not found in store")]
    MessageNotFound { message_number: u64 },

    #[error("Store commit failed: {message}")]
    CommitFailed { message: String },

    #[error("Store I/O failure: {message}")]
    Io { message: String },

    #[error("Store future abandoned before completion")]
    Abandoned,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// Validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
