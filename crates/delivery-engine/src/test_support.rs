//! Shared fixtures for unit tests.

use crate::channel::Channel;
use crate::collaborators::{
    AllowAllSecurityManager, BindingRouter, ConnectionModel, Delivery, ProtocolOutput, Router,
    SecurityManager,
};
use crate::config::ChannelConfig;
use crate::error::ReplyCode;
use crate::message::{
    ChannelId, ContentHeader, MessageMetaData, PublishInfo, QueueName, ServerMessage, Timestamp,
};
use crate::queue::Queue;
use crate::store::{InMemoryMessageStore, MessageStore};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Output and Connection
// ============================================================================

/// A returned message as written to the client
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub message_number: u64,
    pub code: ReplyCode,
    pub text: String,
}

#[derive(Default)]
pub struct RecordingOutput {
    deliveries: Mutex<Vec<Delivery>>,
    returns: Mutex<Vec<ReturnedMessage>>,
    flows: Mutex<Vec<bool>>,
}

impl RecordingOutput {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn returns(&self) -> Vec<ReturnedMessage> {
        self.returns.lock().clone()
    }

    pub fn flows(&self) -> Vec<bool> {
        self.flows.lock().clone()
    }
}

impl ProtocolOutput for RecordingOutput {
    fn write_deliver(&self, _channel: ChannelId, delivery: Delivery) {
        self.deliveries.lock().push(delivery);
    }

    fn write_return(
        &self,
        _channel: ChannelId,
        message: &Arc<ServerMessage>,
        code: ReplyCode,
        text: &str,
    ) {
        self.returns.lock().push(ReturnedMessage {
            message_number: message.message_number(),
            code,
            text: text.to_string(),
        });
    }

    fn write_flow(&self, _channel: ChannelId, active: bool) {
        self.flows.lock().push(active);
    }
}

/// Security manager refusing every publish
pub struct DenyAllSecurityManager;

impl SecurityManager for DenyAllSecurityManager {
    fn authorise_publish(
        &self,
        _immediate: bool,
        _routing_key: Option<&str>,
        _exchange: &str,
    ) -> bool {
        false
    }
}

pub struct TestConnection {
    pub output: Arc<RecordingOutput>,
    principal: Option<String>,
    close_when_no_route: bool,
    security: Arc<dyn SecurityManager>,
    last_received: Mutex<Timestamp>,
    closing: AtomicBool,
    received: Mutex<()>,
    closed: Mutex<Option<(ReplyCode, String)>>,
}

impl TestConnection {
    pub fn new() -> Arc<Self> {
        Self::build(None, true, Arc::new(AllowAllSecurityManager))
    }

    pub fn with_principal(principal: &str) -> Arc<Self> {
        Self::build(Some(principal.to_string()), true, Arc::new(AllowAllSecurityManager))
    }

    pub fn without_close_on_no_route() -> Arc<Self> {
        Self::build(None, false, Arc::new(AllowAllSecurityManager))
    }

    pub fn denying() -> Arc<Self> {
        Self::build(None, true, Arc::new(DenyAllSecurityManager))
    }

    fn build(
        principal: Option<String>,
        close_when_no_route: bool,
        security: Arc<dyn SecurityManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            output: Arc::new(RecordingOutput::default()),
            principal,
            close_when_no_route,
            security,
            last_received: Mutex::new(Timestamp::now()),
            closing: AtomicBool::new(false),
            received: Mutex::new(()),
            closed: Mutex::new(None),
        })
    }

    pub fn set_last_received(&self, time: Timestamp) {
        *self.last_received.lock() = time;
    }

    pub fn closed_with(&self) -> Option<(ReplyCode, String)> {
        self.closed.lock().clone()
    }
}

impl ConnectionModel for TestConnection {
    fn authorized_principal(&self) -> Option<String> {
        self.principal.clone()
    }

    fn close_when_no_route(&self) -> bool {
        self.close_when_no_route
    }

    fn last_received_time(&self) -> Timestamp {
        *self.last_received.lock()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn received_lock(&self) -> &Mutex<()> {
        &self.received
    }

    fn close(&self, code: ReplyCode, reason: &str) {
        self.closing.store(true, Ordering::SeqCst);
        *self.closed.lock() = Some((code, reason.to_string()));
    }

    fn output(&self) -> Arc<dyn ProtocolOutput> {
        self.output.clone()
    }

    fn security_manager(&self) -> Arc<dyn SecurityManager> {
        Arc::clone(&self.security)
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn memory_store() -> Arc<InMemoryMessageStore> {
    Arc::new(InMemoryMessageStore::new())
}

pub fn queue(name: &str, store: &Arc<InMemoryMessageStore>) -> Arc<Queue> {
    Queue::builder(test_queue_name(name), store.clone())
        .build()
        .expect("queue should build")
}

pub fn test_queue_name(name: &str) -> QueueName {
    QueueName::new(name).expect("valid queue name")
}

/// Store a message with the given body under routing key `key`
pub fn message(store: &Arc<InMemoryMessageStore>, key: &str, body: &[u8]) -> Arc<ServerMessage> {
    message_with(
        store,
        PublishInfo::new("amq.direct", Some(key)),
        ContentHeader::new(body.len() as u64),
        body,
    )
}

pub fn message_with(
    store: &Arc<InMemoryMessageStore>,
    publish_info: PublishInfo,
    header: ContentHeader,
    body: &[u8],
) -> Arc<ServerMessage> {
    let metadata = MessageMetaData {
        publish_info,
        header,
        arrival_time: Timestamp::now(),
    };
    let stored = store.add_message(&metadata).expect("store accepts message");
    stored.add_content(0, body).expect("store accepts content");
    Arc::new(ServerMessage::new(metadata, stored))
}

pub fn channel(
    connection: &Arc<TestConnection>,
    store: &Arc<InMemoryMessageStore>,
) -> Arc<Channel> {
    channel_with(connection, store, ChannelConfig::default())
}

pub fn channel_with(
    connection: &Arc<TestConnection>,
    store: &Arc<InMemoryMessageStore>,
    config: ChannelConfig,
) -> Arc<Channel> {
    Channel::new(ChannelId::new(1), connection.clone(), store.clone(), config)
}

/// Router named `amq.direct` binding `queue` under `key`
pub fn router_to(key: &str, queue: &Arc<Queue>) -> Arc<BindingRouter> {
    let router = Arc::new(BindingRouter::new("amq.direct"));
    router.bind(key, Arc::clone(queue));
    router
}

/// Publish a whole message through `channel` in one header and one body frame
pub fn publish(
    channel: &Channel,
    router: &Arc<BindingRouter>,
    info: PublishInfo,
    header: ContentHeader,
    body: &[u8],
) {
    let router: Arc<dyn Router> = router.clone();
    channel.set_publish_frame(info, router).expect("publish accepted");
    channel.publish_content_header(header).expect("header accepted");
    if !body.is_empty() {
        channel
            .publish_content_body(Bytes::copy_from_slice(body))
            .expect("body accepted");
    }
}

/// Publish a plain non-persistent message to routing key `key`
pub fn publish_simple(channel: &Channel, router: &Arc<BindingRouter>, key: &str, body: &[u8]) {
    publish(
        channel,
        router,
        PublishInfo::new("amq.direct", Some(key)),
        ContentHeader::new(body.len() as u64),
        body,
    );
}

// ============================================================================
// Subscription Target
// ============================================================================

/// Target recording what it is sent, with switchable suspension and failure
pub struct RecordingTarget {
    tag: crate::message::ConsumerTag,
    pub credit: crate::credit::CreditManager,
    sent: Mutex<Vec<Arc<crate::instance::MessageInstance>>>,
    suspended: AtomicBool,
    failing: AtomicBool,
    barrier: crate::quiesce::QuiesceBarrier,
}

impl RecordingTarget {
    pub fn new(tag: &str) -> Arc<Self> {
        Self::with_credit(tag, 0)
    }

    pub fn with_credit(tag: &str, prefetch_count: u32) -> Arc<Self> {
        Arc::new(Self {
            tag: crate::message::ConsumerTag::new(tag).expect("valid tag"),
            credit: crate::credit::CreditManager::new(0, prefetch_count),
            sent: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            barrier: crate::quiesce::QuiesceBarrier::new(),
        })
    }

    pub fn sent(&self) -> Vec<Arc<crate::instance::MessageInstance>> {
        self.sent.lock().clone()
    }

    pub fn sent_numbers(&self) -> Vec<u64> {
        self.sent
            .lock()
            .iter()
            .map(|instance| instance.message().message_number())
            .collect()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl crate::subscription::SubscriptionTarget for RecordingTarget {
    fn consumer_tag(&self) -> &crate::message::ConsumerTag {
        &self.tag
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) || !self.credit.has_credit()
    }

    fn generation(&self) -> crate::quiesce::Generation {
        self.barrier.snapshot()
    }

    fn allocate_credit(&self, message: &ServerMessage) -> bool {
        self.credit.allocate(message.size())
    }

    fn restore_credit(&self, message: &ServerMessage) {
        self.credit.restore(1, message.size());
    }

    fn send(
        &self,
        _subscription: &Arc<crate::subscription::Subscription>,
        instance: &Arc<crate::instance::MessageInstance>,
    ) -> Result<(), crate::error::BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(crate::error::BrokerError::ActionFailed {
                message: "target refused delivery".to_string(),
            });
        }
        instance.increment_delivery_count();
        self.sent.lock().push(Arc::clone(instance));
        Ok(())
    }
}

/// Attach a consuming recording target to `queue`
pub fn consume(
    queue: &Arc<Queue>,
    tag: &str,
) -> (Arc<RecordingTarget>, Arc<crate::subscription::Subscription>) {
    let target = RecordingTarget::new(tag);
    let subscription = queue
        .register_subscription(
            target.clone(),
            crate::subscription::SubscriptionOptions::consuming(),
        )
        .expect("subscription registered");
    (target, subscription)
}
