//! Assembly of a published message from its method, header and body frames.

use crate::collaborators::Router;
use crate::error::BrokerError;
use crate::message::{ContentHeader, PublishInfo};
use bytes::Bytes;
use std::sync::Arc;

#[cfg(test)]
#[path = "incoming_tests.rs"]
mod tests;

/// Progress of a message under assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    HeaderPending,
    BodyPending,
    Complete,
}

/// A publish whose frames are still arriving
pub struct IncomingMessage {
    publish_info: PublishInfo,
    router: Arc<dyn Router>,
    header: Option<ContentHeader>,
    chunks: Vec<Bytes>,
    body_received: u64,
}

impl IncomingMessage {
    /// Begin assembling a message published through `router`
    pub fn new(publish_info: PublishInfo, router: Arc<dyn Router>) -> Self {
        Self {
            publish_info,
            router,
            header: None,
            chunks: Vec::new(),
            body_received: 0,
        }
    }

    pub fn publish_info(&self) -> &PublishInfo {
        &self.publish_info
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn header(&self) -> Option<&ContentHeader> {
        self.header.as_ref()
    }

    pub fn body_received(&self) -> u64 {
        self.body_received
    }

    /// Assembly progress
    pub fn state(&self) -> AssemblyState {
        match &self.header {
            None => AssemblyState::HeaderPending,
            Some(header) if self.body_received >= header.body_size => AssemblyState::Complete,
            Some(_) => AssemblyState::BodyPending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == AssemblyState::Complete
    }

    /// Record the content header. A second header is a protocol error.
    pub fn set_header(&mut self, header: ContentHeader) -> Result<(), BrokerError> {
        if self.header.is_some() {
            return Err(BrokerError::protocol_sequence(
                "Received a second content header for the same message",
            ));
        }
        self.header = Some(header);
        Ok(())
    }

    /// Append a body chunk. Fails if the body would exceed the declared size.
    pub fn add_body(&mut self, chunk: Bytes) -> Result<(), BrokerError> {
        let Some(header) = &self.header else {
            return Err(BrokerError::protocol_sequence(
                "Received content body without previously receiving a Content Header",
            ));
        };

        let received = self.body_received + chunk.len() as u64;
        if received > header.body_size {
            return Err(BrokerError::protocol_sequence(format!(
                "Content body exceeds declared size: {} > {}",
                received, header.body_size
            )));
        }

        self.body_received = received;
        self.chunks.push(chunk);
        Ok(())
    }

    /// `[Exchange: x, Routing key: y]`, used in returns and no-route errors
    pub fn description(&self) -> String {
        describe(&self.publish_info)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (PublishInfo, Option<ContentHeader>, Arc<dyn Router>, Vec<Bytes>) {
        (self.publish_info, self.header, self.router, self.chunks)
    }
}

pub(crate) fn describe(info: &PublishInfo) -> String {
    format!(
        "[Exchange: {}, Routing key: {}]",
        info.exchange,
        info.routing_key.as_deref().unwrap_or("null")
    )
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("publish_info", &self.publish_info)
            .field("header", &self.header)
            .field("body_received", &self.body_received)
            .finish()
    }
}
