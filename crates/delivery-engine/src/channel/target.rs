//! Subscription targets that deliver to a channel's client.
//!
//! One target type covers the three consumer kinds:
//!
//! - `Ack` records each delivery in the channel's unacknowledged map and
//!   keeps its credit until the delivery is settled.
//! - `NoAck` dequeues the instance as it is sent and gives the credit back
//!   straight away.
//! - `Browse` never acquires; it only copies the message to the client.

use super::Channel;
use crate::error::BrokerError;
use crate::instance::MessageInstance;
use crate::message::{ChannelId, ConsumerTag, ServerMessage};
use crate::quiesce::Generation;
use crate::subscription::{Subscription, SubscriptionOptions, SubscriptionTarget};
use crate::transaction::{action, AutoCommitTransaction, ServerTransaction};
use std::sync::{Arc, Weak};

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;

/// Acknowledgement mode requested by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Ack,
    NoAck,
    Browse,
}

impl ConsumerMode {
    pub fn subscription_options(self, exclusive: bool) -> SubscriptionOptions {
        let options = match self {
            Self::Browse => SubscriptionOptions::browsing(),
            Self::Ack | Self::NoAck => SubscriptionOptions::consuming(),
        };
        options.with_exclusive(exclusive)
    }
}

pub struct ConsumerTarget {
    mode: ConsumerMode,
    tag: ConsumerTag,
    channel_id: ChannelId,
    channel: Weak<Channel>,
}

impl ConsumerTarget {
    pub(crate) fn new(mode: ConsumerMode, tag: ConsumerTag, channel: &Arc<Channel>) -> Self {
        Self {
            mode,
            tag,
            channel_id: channel.id(),
            channel: Arc::downgrade(channel),
        }
    }

    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    fn channel(&self) -> Result<Arc<Channel>, BrokerError> {
        self.channel.upgrade().ok_or(BrokerError::ChannelClosing {
            channel_id: self.channel_id.value(),
        })
    }
}

impl SubscriptionTarget for ConsumerTarget {
    fn consumer_tag(&self) -> &ConsumerTag {
        &self.tag
    }

    fn is_suspended(&self) -> bool {
        match self.channel.upgrade() {
            Some(channel) => channel.is_suspended() || !channel.credit().has_credit(),
            None => true,
        }
    }

    fn generation(&self) -> Generation {
        self.channel
            .upgrade()
            .map(|channel| channel.generation())
            .unwrap_or_default()
    }

    fn allocate_credit(&self, message: &ServerMessage) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.credit().allocate(message.size()))
    }

    fn restore_credit(&self, message: &ServerMessage) {
        if let Some(channel) = self.channel.upgrade() {
            channel.credit().restore(1, message.size());
        }
    }

    fn send(
        &self,
        subscription: &Arc<Subscription>,
        instance: &Arc<MessageInstance>,
    ) -> Result<(), BrokerError> {
        let channel = self.channel()?;

        match self.mode {
            ConsumerMode::Ack => {
                let delivery_tag =
                    channel.record_delivery(Arc::clone(instance), Arc::clone(subscription));
                instance.increment_delivery_count();
                instance.set_delivered_to_consumer();
                channel.write_delivery(&self.tag, delivery_tag, instance);
            }
            ConsumerMode::NoAck => {
                let consumed = Arc::clone(instance);
                let mut txn = AutoCommitTransaction::new(Arc::clone(channel.store()));
                txn.dequeue(
                    std::slice::from_ref(instance),
                    action(
                        move || {
                            consumed.delete();
                            Ok(())
                        },
                        || {},
                    ),
                )?;

                let delivery_tag = channel.next_delivery_tag();
                instance.increment_delivery_count();
                instance.set_delivered_to_consumer();
                channel.write_delivery(&self.tag, delivery_tag, instance);
                channel.credit().restore(1, instance.message().size());
            }
            ConsumerMode::Browse => {
                let delivery_tag = channel.next_delivery_tag();
                channel.write_delivery(&self.tag, delivery_tag, instance);
                channel.credit().restore(1, instance.message().size());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerTarget")
            .field("mode", &self.mode)
            .field("tag", &self.tag)
            .field("channel_id", &self.channel_id)
            .finish()
    }
}
