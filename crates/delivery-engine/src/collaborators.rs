//! Interfaces of the components the engine drives but does not own.
//!
//! Routing, authorization, the connection/transport and frame output are
//! all supplied by the embedding broker. The simple implementations here
//! ([`BindingRouter`], [`AllowAllSecurityManager`]) are enough to run the
//! engine standalone.

use crate::error::{BrokerError, ReplyCode};
use crate::instance::MessageInstance;
use crate::message::{
    ChannelId, ConsumerTag, DeliveryTag, InstanceProperties, QueueName, ServerMessage, Timestamp,
};
use crate::queue::Queue;
use crate::transaction::{action, ServerTransaction};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "collaborators_tests.rs"]
mod tests;

/// Callback run against every instance a routed message creates
pub type EnqueueCallback = Arc<dyn Fn(&Arc<MessageInstance>) + Send + Sync>;

// ============================================================================
// Routing
// ============================================================================

/// Exchange-like router mapping a published message to destination queues
pub trait Router: Send + Sync {
    fn name(&self) -> &str;

    /// Register an enqueue on every destination queue with `transaction`.
    ///
    /// The instances only appear on their queues once the transaction
    /// commits; `post_enqueue` then runs for each of them. Returns the number
    /// of destination queues.
    fn send(
        &self,
        message: &Arc<ServerMessage>,
        properties: InstanceProperties,
        transaction: &mut dyn ServerTransaction,
        post_enqueue: Option<EnqueueCallback>,
    ) -> Result<usize, BrokerError>;
}

/// Direct-style router: the routing key selects the bound queues
pub struct BindingRouter {
    name: String,
    bindings: RwLock<HashMap<String, Vec<Arc<Queue>>>>,
}

impl BindingRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a queue under a routing key. Binding twice is a no-op.
    pub fn bind(&self, routing_key: impl Into<String>, queue: Arc<Queue>) {
        let mut bindings = self.bindings.write();
        let queues = bindings.entry(routing_key.into()).or_default();
        if !queues.iter().any(|q| q.name() == queue.name()) {
            queues.push(queue);
        }
    }

    pub fn unbind(&self, routing_key: &str, queue: &QueueName) -> bool {
        let mut bindings = self.bindings.write();
        match bindings.get_mut(routing_key) {
            Some(queues) => {
                let before = queues.len();
                queues.retain(|q| q.name() != queue);
                before != queues.len()
            }
            None => false,
        }
    }

    pub fn bound_queues(&self, routing_key: &str) -> Vec<Arc<Queue>> {
        self.bindings
            .read()
            .get(routing_key)
            .cloned()
            .unwrap_or_default()
    }
}

impl Router for BindingRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(
        &self,
        message: &Arc<ServerMessage>,
        properties: InstanceProperties,
        transaction: &mut dyn ServerTransaction,
        post_enqueue: Option<EnqueueCallback>,
    ) -> Result<usize, BrokerError> {
        let queues = self.bound_queues(message.routing_key().unwrap_or_default());

        for queue in &queues {
            let target = Arc::clone(queue);
            let routed = Arc::clone(message);
            let callback = post_enqueue.clone();
            transaction.enqueue(
                queue,
                message,
                action(
                    move || {
                        target.enqueue(routed, properties, callback);
                        Ok(())
                    },
                    || {},
                ),
            )?;
        }

        debug!(
            exchange = %self.name,
            routing_key = ?message.routing_key(),
            queues = queues.len(),
            "Message routed"
        );
        Ok(queues.len())
    }
}

// ============================================================================
// Security
// ============================================================================

/// Authorization decisions for publishing
pub trait SecurityManager: Send + Sync {
    fn authorise_publish(&self, immediate: bool, routing_key: Option<&str>, exchange: &str) -> bool;
}

/// Security manager that permits every publish
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllSecurityManager;

impl SecurityManager for AllowAllSecurityManager {
    fn authorise_publish(
        &self,
        _immediate: bool,
        _routing_key: Option<&str>,
        _exchange: &str,
    ) -> bool {
        true
    }
}

// ============================================================================
// Connection and Output
// ============================================================================

/// A message delivery written to the client
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub delivery_count: u32,
    pub message: Arc<ServerMessage>,
}

/// Frame output towards the client
pub trait ProtocolOutput: Send + Sync {
    fn write_deliver(&self, channel: ChannelId, delivery: Delivery);

    fn write_return(
        &self,
        channel: ChannelId,
        message: &Arc<ServerMessage>,
        code: ReplyCode,
        text: &str,
    );

    fn write_flow(&self, channel: ChannelId, active: bool);
}

/// The connection a channel belongs to
pub trait ConnectionModel: Send + Sync {
    /// Authenticated user name, used to check the user-id property
    fn authorized_principal(&self) -> Option<String>;

    /// Close the connection when a mandatory transactional publish has no route
    fn close_when_no_route(&self) -> bool;

    fn last_received_time(&self) -> Timestamp;

    fn is_closing(&self) -> bool;

    /// Lock serializing connection closure against the frame receive path
    fn received_lock(&self) -> &Mutex<()>;

    fn close(&self, code: ReplyCode, reason: &str);

    fn output(&self) -> Arc<dyn ProtocolOutput>;

    fn security_manager(&self) -> Arc<dyn SecurityManager>;
}
