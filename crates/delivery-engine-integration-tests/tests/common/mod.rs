//! Common test utilities for delivery engine integration tests
//!
//! This module provides:
//! - A recording client connection and frame output
//! - A small broker fixture with a store, a direct router and queues
//! - Publish helpers driving the channel frame by frame

#![allow(dead_code)]

use bytes::Bytes;
use delivery_engine::{
    AllowAllSecurityManager, BindingRouter, Channel, ChannelConfig, ChannelId, ConnectionModel,
    ContentHeader, Delivery, FlowThresholds, InMemoryMessageStore, MessageStore, ProtocolOutput,
    PublishInfo, Queue, QueueName, ReplyCode, Router, SecurityManager, ServerMessage, Timestamp,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const EXCHANGE: &str = "amq.direct";

// ============================================================================
// Client Side
// ============================================================================

#[derive(Debug, Clone)]
pub struct Returned {
    pub channel: ChannelId,
    pub message_number: u64,
    pub code: ReplyCode,
    pub text: String,
}

/// Frame output recording everything written to the client
#[derive(Default)]
pub struct RecordingOutput {
    deliveries: Mutex<Vec<(ChannelId, Delivery)>>,
    returns: Mutex<Vec<Returned>>,
    flows: Mutex<Vec<(ChannelId, bool)>>,
}

impl RecordingOutput {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn deliveries_on(&self, channel: ChannelId) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn returns(&self) -> Vec<Returned> {
        self.returns.lock().clone()
    }

    pub fn flows(&self) -> Vec<(ChannelId, bool)> {
        self.flows.lock().clone()
    }
}

impl ProtocolOutput for RecordingOutput {
    fn write_deliver(&self, channel: ChannelId, delivery: Delivery) {
        self.deliveries.lock().push((channel, delivery));
    }

    fn write_return(
        &self,
        channel: ChannelId,
        message: &Arc<ServerMessage>,
        code: ReplyCode,
        text: &str,
    ) {
        self.returns.lock().push(Returned {
            channel,
            message_number: message.message_number(),
            code,
            text: text.to_string(),
        });
    }

    fn write_flow(&self, channel: ChannelId, active: bool) {
        self.flows.lock().push((channel, active));
    }
}

pub struct TestConnection {
    pub output: Arc<RecordingOutput>,
    last_received: Mutex<Timestamp>,
    closing: AtomicBool,
    received: Mutex<()>,
    closed: Mutex<Option<(ReplyCode, String)>>,
}

impl TestConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            output: Arc::new(RecordingOutput::default()),
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
        Some("guest".to_string())
    }

    fn close_when_no_route(&self) -> bool {
        true
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
        Arc::new(AllowAllSecurityManager)
    }
}

// ============================================================================
// Broker Fixture
// ============================================================================

pub struct Broker {
    pub store: Arc<InMemoryMessageStore>,
    pub router: Arc<BindingRouter>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryMessageStore::new()),
            router: Arc::new(BindingRouter::new(EXCHANGE)),
        }
    }

    pub fn store_handle(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// Declare a queue and bind it under its own name
    pub fn queue(&self, name: &str) -> Arc<Queue> {
        self.declare(Queue::builder(queue_name(name), self.store_handle()))
    }

    pub fn durable_queue(&self, name: &str) -> Arc<Queue> {
        self.declare(Queue::builder(queue_name(name), self.store_handle()).durable(true))
    }

    pub fn bounded_queue(&self, name: &str, stop_count: u64, resume_count: u64) -> Arc<Queue> {
        self.declare(
            Queue::builder(queue_name(name), self.store_handle()).flow_thresholds(FlowThresholds {
                stop_count,
                resume_count,
                ..FlowThresholds::default()
            }),
        )
    }

    pub fn declare(&self, builder: delivery_engine::queue::QueueBuilder) -> Arc<Queue> {
        let queue = builder.build().expect("queue should build");
        self.router.bind(queue.name().as_str(), Arc::clone(&queue));
        queue
    }

    pub fn channel(&self, connection: &Arc<TestConnection>, id: u16) -> Arc<Channel> {
        self.channel_with(connection, id, ChannelConfig::default())
    }

    pub fn channel_with(
        &self,
        connection: &Arc<TestConnection>,
        id: u16,
        config: ChannelConfig,
    ) -> Arc<Channel> {
        Channel::new(ChannelId::new(id), connection.clone(), self.store_handle(), config)
    }

    /// Publish a message in header and body frames
    pub fn publish(
        &self,
        channel: &Channel,
        info: PublishInfo,
        header: ContentHeader,
        body: &[u8],
    ) {
        let router: Arc<dyn Router> = self.router.clone();
        channel.set_publish_frame(info, router).expect("publish accepted");
        channel.publish_content_header(header).expect("header accepted");
        if !body.is_empty() {
            channel
                .publish_content_body(Bytes::copy_from_slice(body))
                .expect("body accepted");
        }
    }

    pub fn publish_to(&self, channel: &Channel, queue: &str, body: &[u8]) {
        self.publish(
            channel,
            PublishInfo::new(EXCHANGE, Some(queue)),
            ContentHeader::new(body.len() as u64),
            body,
        );
    }

    pub fn publish_persistent(&self, channel: &Channel, queue: &str, body: &[u8]) {
        self.publish(
            channel,
            PublishInfo::new(EXCHANGE, Some(queue)),
            ContentHeader::new(body.len() as u64).persistent(),
            body,
        );
    }
}

pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name).expect("valid queue name")
}

/// Poll `condition` until it holds, yielding to background tasks between
/// checks
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.is_ok()
}
