//! Message types and core domain identifiers.

use crate::error::ValidationError;
use crate::store::StoredMessage;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Maximum length of an AMQP short string
const SHORT_STRING_MAX: usize = 255;

fn validate_short_string(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > SHORT_STRING_MAX {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be 1-{} characters", SHORT_STRING_MAX),
        });
    }

    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "only printable ASCII without whitespace allowed".to_string(),
        });
    }

    Ok(())
}

/// Validated queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_short_string("queue_name", &name)?;
        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Tag identifying one consumer on a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Create new consumer tag with validation
    pub fn new(tag: impl Into<String>) -> Result<Self, ValidationError> {
        let tag = tag.into();
        validate_short_string("consumer_tag", &tag)?;
        Ok(Self(tag))
    }

    /// Server generated tag for consumers that did not choose one
    pub fn generated(sequence: u32) -> Self {
        Self(format!("sgen_{}", sequence))
    }

    /// Get consumer tag as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConsumerTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Per-channel delivery tag. Tags start at 1 and strictly increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry on its queue. Zero is reserved for the list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub const HEAD: EntryId = EntryId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The id that follows this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocate a fresh subscription id
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Channel number within a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u16);

impl ChannelId {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp shifted forward by the given number of milliseconds
    pub fn add_millis(&self, millis: i64) -> Self {
        Self(self.0 + Duration::milliseconds(millis))
    }

    /// Milliseconds elapsed between this timestamp and `later`
    pub fn millis_until(&self, later: &Timestamp) -> i64 {
        (later.0 - self.0).num_milliseconds()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// Publish Metadata
// ============================================================================

/// Fields of the publish method that started a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishInfo {
    pub exchange: String,
    pub routing_key: Option<String>,
    pub mandatory: bool,
    pub immediate: bool,
}

impl PublishInfo {
    /// Publish info for `exchange`, neither mandatory nor immediate
    pub fn new(exchange: impl Into<String>, routing_key: Option<&str>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.map(str::to_string),
            mandatory: false,
            immediate: false,
        }
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

/// Delivery mode carried in the basic content header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    NonPersistent,
    Persistent,
}

/// Basic content header properties used by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub user_id: Option<String>,
    pub expiration: Option<Timestamp>,
    pub timestamp: Option<Timestamp>,
    pub delivery_mode: DeliveryMode,
}

/// Content header frame: declared body size plus properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn new(body_size: u64) -> Self {
        Self {
            body_size,
            properties: BasicProperties::default(),
        }
    }

    /// Request persistent delivery mode
    pub fn persistent(mut self) -> Self {
        self.properties.delivery_mode = DeliveryMode::Persistent;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.properties.user_id = Some(user_id.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Timestamp) -> Self {
        self.properties.expiration = Some(expiration);
        self
    }
}

/// Metadata handed to the message store when a message is first stored
#[derive(Debug, Clone)]
pub struct MessageMetaData {
    pub publish_info: PublishInfo,
    pub header: ContentHeader,
    pub arrival_time: Timestamp,
}

// ============================================================================
// Server Message
// ============================================================================

/// A fully received message. Shared between every queue it was routed to and
/// every in-flight holder; the last `Arc` to drop releases it.
pub struct ServerMessage {
    publish_info: PublishInfo,
    header: ContentHeader,
    arrival_time: Timestamp,
    stored: Arc<dyn StoredMessage>,
}

impl ServerMessage {
    /// Wrap stored content together with its routing metadata
    pub fn new(metadata: MessageMetaData, stored: Arc<dyn StoredMessage>) -> Self {
        Self {
            publish_info: metadata.publish_info,
            header: metadata.header,
            arrival_time: metadata.arrival_time,
            stored,
        }
    }

    /// Store-assigned message number
    pub fn message_number(&self) -> u64 {
        self.stored.message_number()
    }

    pub fn publish_info(&self) -> &PublishInfo {
        &self.publish_info
    }

    pub fn header(&self) -> &ContentHeader {
        &self.header
    }

    /// Time the message reached the broker
    pub fn arrival_time(&self) -> Timestamp {
        self.arrival_time
    }

    /// Routing key, if the publish carried one
    pub fn routing_key(&self) -> Option<&str> {
        self.publish_info.routing_key.as_deref()
    }

    /// Declared body size in bytes
    pub fn size(&self) -> u64 {
        self.header.body_size
    }

    /// Whether the publisher asked for persistent delivery
    pub fn is_persistent(&self) -> bool {
        self.header.properties.delivery_mode == DeliveryMode::Persistent
    }

    pub fn is_mandatory(&self) -> bool {
        self.publish_info.mandatory
    }

    pub fn is_immediate(&self) -> bool {
        self.publish_info.immediate
    }

    pub fn expiration(&self) -> Option<Timestamp> {
        self.header.properties.expiration
    }

    /// Message body as held by the store
    pub fn content(&self) -> Bytes {
        self.stored.content()
    }

    /// Handle to the content held by the store
    pub fn stored(&self) -> &Arc<dyn StoredMessage> {
        &self.stored
    }
}

impl std::fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMessage")
            .field("message_number", &self.message_number())
            .field("exchange", &self.publish_info.exchange)
            .field("routing_key", &self.publish_info.routing_key)
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for ServerMessage {
    fn drop(&mut self) {
        self.stored.remove();
    }
}

/// Immutable view of per-placement properties captured at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceProperties {
    pub expiration: Option<Timestamp>,
    pub immediate: bool,
    pub persistent: bool,
    pub mandatory: bool,
    pub redelivered: bool,
}

impl InstanceProperties {
    /// Properties of a freshly published message
    pub fn for_publish(message: &ServerMessage) -> Self {
        Self {
            expiration: message.expiration(),
            immediate: message.is_immediate(),
            persistent: message.is_persistent(),
            mandatory: message.is_mandatory(),
            redelivered: false,
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
