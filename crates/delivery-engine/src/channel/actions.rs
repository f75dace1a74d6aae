//! Deferred work a channel registers with its transactions and routers.

use super::Channel;
use crate::collaborators::{EnqueueCallback, ProtocolOutput};
use crate::credit::CreditManager;
use crate::error::{BrokerError, ReplyCode};
use crate::instance::MessageInstance;
use crate::message::{ChannelId, ServerMessage};
use crate::transaction::{LocalTransaction, ServerTransaction, TransactionAction};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "actions_tests.rs"]
mod tests;

pub const IMMEDIATE_DELIVERY_REPLY_TEXT: &str = "Immediate delivery is not possible.";

// ============================================================================
// Acknowledgement
// ============================================================================

/// Deletes acknowledged instances on commit.
///
/// On rollback the instances are released, unless the rollback was asked for
/// by the client, in which case they go to the resend list and are
/// redelivered once the rollback completes.
pub struct AcknowledgeAction {
    acked: Vec<Arc<MessageInstance>>,
    credit: Arc<CreditManager>,
    resend_list: Arc<Mutex<Vec<Arc<MessageInstance>>>>,
    rolling_back: Arc<AtomicBool>,
}

impl AcknowledgeAction {
    pub fn new(
        acked: Vec<Arc<MessageInstance>>,
        credit: Arc<CreditManager>,
        resend_list: Arc<Mutex<Vec<Arc<MessageInstance>>>>,
        rolling_back: Arc<AtomicBool>,
    ) -> Self {
        Self {
            acked,
            credit,
            resend_list,
            rolling_back,
        }
    }
}

impl TransactionAction for AcknowledgeAction {
    fn post_commit(self: Box<Self>) -> Result<(), BrokerError> {
        for instance in &self.acked {
            instance.delete();
            self.credit.restore(1, instance.message().size());
        }
        Ok(())
    }

    fn on_rollback(self: Box<Self>) {
        if self.rolling_back.load(Ordering::SeqCst) {
            self.resend_list.lock().extend(self.acked);
            return;
        }

        for instance in &self.acked {
            instance.set_redelivered();
            self.credit.restore(1, instance.message().size());
            instance.release();
        }
    }
}

// ============================================================================
// Returns
// ============================================================================

/// Writes a returned message to the publisher once the transaction commits
pub struct WriteReturnAction {
    output: Arc<dyn ProtocolOutput>,
    channel_id: ChannelId,
    message: Arc<ServerMessage>,
    code: ReplyCode,
    text: String,
}

impl WriteReturnAction {
    pub fn new(
        output: Arc<dyn ProtocolOutput>,
        channel_id: ChannelId,
        message: Arc<ServerMessage>,
        code: ReplyCode,
        text: impl Into<String>,
    ) -> Self {
        Self {
            output,
            channel_id,
            message,
            code,
            text: text.into(),
        }
    }
}

impl TransactionAction for WriteReturnAction {
    fn post_commit(self: Box<Self>) -> Result<(), BrokerError> {
        debug!(
            channel = %self.channel_id,
            code = %self.code,
            message_number = self.message.message_number(),
            "Returning message to publisher"
        );
        self.output.write_return(self.channel_id, &self.message, self.code, &self.text);
        Ok(())
    }

    fn on_rollback(self: Box<Self>) {}
}

// ============================================================================
// Post-Enqueue Callbacks
// ============================================================================

/// Return an immediate message that no consumer took, otherwise check the
/// queue's capacity against the publishing channel
pub fn immediate_callback(channel: Weak<Channel>) -> EnqueueCallback {
    Arc::new(move |instance: &Arc<MessageInstance>| {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let Some(queue) = instance.owning_queue() else {
            return;
        };

        if instance.delivered_to_consumer() || !instance.acquire(None) {
            queue.check_capacity(&channel);
            return;
        }

        instance.delete();
        let mut txn = LocalTransaction::new(Arc::clone(channel.store()));
        let returned = WriteReturnAction::new(
            channel.output(),
            channel.id(),
            Arc::clone(instance.message()),
            ReplyCode::NoConsumers,
            IMMEDIATE_DELIVERY_REPLY_TEXT,
        );

        let result = txn
            .dequeue(std::slice::from_ref(instance), Box::new(returned))
            .and_then(|()| txn.commit(None));
        if let Err(e) = result {
            warn!(
                channel = %channel.id(),
                queue = %queue.name(),
                error = %e,
                "Failed to return immediate message",
            );
        }
    })
}

/// Block the publishing channel if the queue went over its flow limit
pub fn capacity_check_callback(channel: Weak<Channel>) -> EnqueueCallback {
    Arc::new(move |instance: &Arc<MessageInstance>| {
        if let (Some(channel), Some(queue)) = (channel.upgrade(), instance.owning_queue()) {
            queue.check_capacity(&channel);
        }
    })
}
