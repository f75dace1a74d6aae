//! Publish/consume soak run.

use crate::connection::{ClientEvent, LocalConnection};
use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Args;
use delivery_engine::{
    BindingRouter, Channel, ChannelId, ChannelMonitor, ConsumerMode, ContentHeader, DeliveryConfig,
    InMemoryMessageStore, MessageStore, PublishInfo, Queue, QueueName, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "soak_tests.rs"]
mod tests;

const EXCHANGE: &str = "amq.direct";

#[derive(Debug, Clone, Args)]
pub struct SoakArgs {
    /// Queue to publish to and consume from
    #[arg(long, default_value = "soak")]
    pub queue: String,

    /// Messages to publish
    #[arg(short, long, default_value = "1000")]
    pub messages: u64,

    /// Body size in bytes
    #[arg(long, default_value = "256")]
    pub body_size: usize,

    /// Publish in local transactions of this many messages (0 = auto-commit)
    #[arg(long, default_value = "0")]
    pub batch: u64,

    /// Requeue every n-th first delivery instead of acknowledging it (0 = never)
    #[arg(long, default_value = "0")]
    pub requeue_every: u64,

    /// Override the configured prefetch count
    #[arg(long)]
    pub prefetch: Option<u32>,

    /// Make the queue durable and the messages persistent
    #[arg(long)]
    pub durable: bool,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    pub timeout_secs: u64,
}

/// Outcome of a soak run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SoakReport {
    pub published: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub returned: u64,
    pub remaining: u64,
}

impl SoakReport {
    pub fn log(&self) {
        info!(
            published = self.published,
            delivered = self.delivered,
            acknowledged = self.acknowledged,
            requeued = self.requeued,
            returned = self.returned,
            remaining = self.remaining,
            "Soak run finished"
        );
    }
}

/// Drive publishers and consumers against an in-memory broker and report totals
pub async fn run(config: &DeliveryConfig, args: SoakArgs) -> anyhow::Result<SoakReport> {
    let store = Arc::new(InMemoryMessageStore::new());
    let store_handle: Arc<dyn MessageStore> = store.clone();
    let queue_name = QueueName::new(args.queue.clone()).context("invalid queue name")?;

    let queue = Queue::builder(queue_name.clone(), Arc::clone(&store_handle))
        .durable(args.durable)
        .maximum_delivery_count(config.queues.maximum_delivery_count)
        .flow_thresholds(config.queues.flow_thresholds())
        .build()
        .context("invalid queue configuration")?;
    let router = Arc::new(BindingRouter::new(EXCHANGE));
    router.bind(queue_name.as_str(), Arc::clone(&queue));
    let router: Arc<dyn Router> = router;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let connection = LocalConnection::new(None, config.channel.close_when_no_route, events_tx);

    let mut channel_config = config.channel.clone();
    if let Some(prefetch) = args.prefetch {
        channel_config.prefetch_count = prefetch;
    }
    let publisher = Channel::new(
        ChannelId::new(1),
        connection.clone(),
        Arc::clone(&store_handle),
        channel_config.clone(),
    );
    let consumer =
        Channel::new(ChannelId::new(2), connection.clone(), store_handle, channel_config);

    let monitor = Arc::new(ChannelMonitor::new());
    monitor.register(&publisher);
    monitor.register(&consumer);
    let housekeeping = monitor.spawn(
        config.transactions.housekeeping_interval(),
        config.transactions.timeouts(),
    );
    let delivery = queue.spawn_delivery();

    if args.batch > 0 {
        publisher.set_local_transactional();
    }
    consumer
        .subscribe_to_queue(None, &queue, ConsumerMode::Ack, false)
        .context("subscribe failed")?;

    let mut report = SoakReport::default();
    let body = Bytes::from(vec![b'x'; args.body_size]);
    for sequence in 0..args.messages {
        connection.touch();
        let mut header = ContentHeader::new(body.len() as u64);
        if args.durable {
            header = header.persistent();
        }

        let info = PublishInfo::new(EXCHANGE, Some(queue_name.as_str()));
        publisher.set_publish_frame(info, Arc::clone(&router))?;
        publisher.publish_content_header(header)?;
        if !body.is_empty() {
            publisher.publish_content_body(body.clone())?;
        }
        report.published += 1;

        if args.batch > 0 && (sequence + 1) % args.batch == 0 {
            publisher.commit(None)?;
            debug!(sequence, "Batch committed");
        }
    }
    if args.batch > 0 {
        publisher.commit(None)?;
    }
    publisher.sync()?;

    let consumed = tokio::time::timeout(
        Duration::from_secs(args.timeout_secs),
        consume(&consumer, &connection, &mut events, &args, &mut report),
    )
    .await;

    housekeeping.abort();
    delivery.abort();
    publisher.close();
    consumer.close();
    report.remaining = queue.message_count();

    match consumed {
        Ok(result) => result.map(|()| report),
        Err(_) => {
            report.log();
            bail!(
                "timed out after {}s with {} acknowledged",
                args.timeout_secs,
                report.acknowledged,
            )
        }
    }
}

async fn consume(
    consumer: &Arc<Channel>,
    connection: &LocalConnection,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    args: &SoakArgs,
    report: &mut SoakReport,
) -> anyhow::Result<()> {
    while report.acknowledged + report.returned < report.published {
        let Some(event) = events.recv().await else {
            bail!("client event stream closed");
        };
        connection.touch();

        match event {
            ClientEvent::Deliver { delivery, .. } => {
                report.delivered += 1;
                let requeue = args.requeue_every > 0
                    && !delivery.redelivered
                    && report.delivered % args.requeue_every == 0;

                if requeue {
                    consumer.requeue_tag(delivery.delivery_tag);
                    report.requeued += 1;
                } else {
                    consumer.acknowledge_message(delivery.delivery_tag, false)?;
                    report.acknowledged += 1;
                }
            }
            ClientEvent::Return { code, text, .. } => {
                warn!(code = %code, text, "Message returned");
                report.returned += 1;
            }
            ClientEvent::Flow { channel, active } => {
                info!(channel = %channel, active, "Flow changed");
            }
        }

        if let Some((code, reason)) = connection.close_reason() {
            bail!("connection closed by broker: {} {}", code, reason);
        }
    }
    Ok(())
}
