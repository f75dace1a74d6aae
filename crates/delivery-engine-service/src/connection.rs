//! In-process connection and frame output for the soak service.
//!
//! Frames the engine writes to the client are forwarded as [`ClientEvent`]s
//! over an unbounded channel, so the simulated client can react to them from
//! its own task.

use delivery_engine::{
    AllowAllSecurityManager, ChannelId, ConnectionModel, Delivery, ProtocolOutput, ReplyCode,
    SecurityManager, ServerMessage, Timestamp,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// A frame written to the simulated client
#[derive(Debug)]
pub enum ClientEvent {
    Deliver {
        channel: ChannelId,
        delivery: Delivery,
    },
    Return {
        channel: ChannelId,
        message_number: u64,
        code: ReplyCode,
        text: String,
    },
    Flow {
        channel: ChannelId,
        active: bool,
    },
}

pub struct ChannelOutput {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelOutput {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { events }
    }

    fn forward(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Client event dropped: receiver closed");
        }
    }
}

impl ProtocolOutput for ChannelOutput {
    fn write_deliver(&self, channel: ChannelId, delivery: Delivery) {
        self.forward(ClientEvent::Deliver { channel, delivery });
    }

    fn write_return(
        &self,
        channel: ChannelId,
        message: &Arc<ServerMessage>,
        code: ReplyCode,
        text: &str,
    ) {
        self.forward(ClientEvent::Return {
            channel,
            message_number: message.message_number(),
            code,
            text: text.to_string(),
        });
    }

    fn write_flow(&self, channel: ChannelId, active: bool) {
        self.forward(ClientEvent::Flow { channel, active });
    }
}

/// Connection owned by the soak client
pub struct LocalConnection {
    principal: Option<String>,
    close_when_no_route: bool,
    output: Arc<ChannelOutput>,
    security: Arc<dyn SecurityManager>,
    last_received: Mutex<Timestamp>,
    closing: AtomicBool,
    received: Mutex<()>,
    close_reason: Mutex<Option<(ReplyCode, String)>>,
}

impl LocalConnection {
    pub fn new(
        principal: Option<String>,
        close_when_no_route: bool,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            principal,
            close_when_no_route,
            output: Arc::new(ChannelOutput::new(events)),
            security: Arc::new(AllowAllSecurityManager),
            last_received: Mutex::new(Timestamp::now()),
            closing: AtomicBool::new(false),
            received: Mutex::new(()),
            close_reason: Mutex::new(None),
        })
    }

    /// Record frame activity from the client
    pub fn touch(&self) {
        *self.last_received.lock() = Timestamp::now();
    }

    /// Reply code and text of the close, once the connection was closed
    pub fn close_reason(&self) -> Option<(ReplyCode, String)> {
        self.close_reason.lock().clone()
    }
}

impl ConnectionModel for LocalConnection {
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
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(code = %code, reason, "Connection closed by broker");
        *self.close_reason.lock() = Some((code, reason.to_string()));
    }

    fn output(&self) -> Arc<dyn ProtocolOutput> {
        self.output.clone()
    }

    fn security_manager(&self) -> Arc<dyn SecurityManager> {
        Arc::clone(&self.security)
    }
}
