//! Ingestion job queue between the sync tasks and the writer.
//!
//! Jobs travel as JSON `{"kind": "chat" | "consume", "payload": {...}}`.
//! In production they go through RabbitMQ; the embedded mode and the tests
//! use an in-process channel.

use crate::RabbitMQConfig;
use crate::blued::{RawChat, RawConsume};
use crate::error::SyncError;
use crate::worker::IngestWorker;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where a chat belongs. Carried in the job so the writer never has to look
/// the session up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRef {
    pub id: i32,
    pub lid: i64,
    pub anchor_uid: i64,
    pub anchor_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatJob {
    pub chat: RawChat,
    pub live: LiveRef,
    pub dedupe_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeJob {
    pub consume: RawConsume,
    pub lid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum IngestJob {
    Chat(ChatJob),
    Consume(ConsumeJob),
}

impl IngestJob {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestJob::Chat(_) => "chat",
            IngestJob::Consume(_) => "consume",
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: IngestJob) -> Result<(), SyncError>;
}

/// Declares the durable exchange and queue the jobs flow through.
pub async fn declare_topology(channel: &Channel) -> Result<(), SyncError> {
    channel
        .exchange_declare(
            RabbitMQConfig::INGEST_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            RabbitMQConfig::INGEST_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            RabbitMQConfig::INGEST_QUEUE,
            RabbitMQConfig::INGEST_EXCHANGE,
            RabbitMQConfig::INGEST_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

/// Publishes jobs to RabbitMQ as persistent messages.
pub struct RabbitQueue {
    // Dropping the connection closes the channel.
    _connection: Connection,
    channel: Channel,
}

impl RabbitQueue {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        info!("Declaring RabbitMQ exchanges and queues...");
        declare_topology(&channel).await?;

        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

#[async_trait]
impl JobQueue for RabbitQueue {
    async fn enqueue(&self, job: IngestJob) -> Result<(), SyncError> {
        let payload = serde_json::to_vec(&job)?;

        self.channel
            .basic_publish(
                RabbitMQConfig::INGEST_EXCHANGE,
                RabbitMQConfig::INGEST_ROUTING_KEY,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        Ok(())
    }
}

/// In-process queue drained by [`run_local_worker`].
pub struct LocalQueue {
    sender: mpsc::UnboundedSender<IngestJob>,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IngestJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, job: IngestJob) -> Result<(), SyncError> {
        self.sender
            .send(job)
            .map_err(|e| SyncError::Queue(format!("local worker is gone: {}", e)))
    }
}

pub async fn run_local_worker(mut jobs: mpsc::UnboundedReceiver<IngestJob>, worker: IngestWorker) {
    while let Some(job) = jobs.recv().await {
        if let Err(e) = worker.handle(&job).await {
            error!("Error processing {} job: {}", job.kind(), e);
        }
    }
    info!("Local ingest worker stopped");
}

/// Opens a consumer on the ingest queue with manual acks.
pub async fn open_consumer(channel: &Channel, tag: &str) -> Result<Consumer, SyncError> {
    channel.basic_qos(25, BasicQosOptions::default()).await?;

    let consumer = channel
        .basic_consume(
            RabbitMQConfig::INGEST_QUEUE,
            tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;

    Ok(consumer)
}

/// Feeds deliveries to `worker`. A job is acked once stored and rejected
/// without requeue when it cannot be decoded or stored.
pub async fn run_rabbit_consumer(
    mut consumer: Consumer,
    worker: IngestWorker,
) -> Result<(), SyncError> {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Error receiving message: {}", e);
                continue;
            }
        };

        let outcome = match serde_json::from_slice::<IngestJob>(&delivery.data) {
            Ok(job) => worker.handle(&job).await.map(|_| job.kind()),
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(kind) => {
                debug!("Stored {} job", kind);
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Err(e) => {
                warn!("Rejecting ingest job: {}", e);
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_wire_format() {
        let job = IngestJob::Consume(ConsumeJob {
            consume: RawConsume {
                user_id: 7,
                user_name: "alice".to_string(),
                amount: 520,
            },
            lid: 5000,
        });

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], json!("consume"));
        assert_eq!(value["payload"]["lid"], json!(5000));
        assert_eq!(value["payload"]["consume"]["amount"], json!(520));

        let decoded: IngestJob = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let value = json!({"kind": "gift", "payload": {}});
        assert!(serde_json::from_value::<IngestJob>(value).is_err());
    }

    #[tokio::test]
    async fn test_local_queue_delivers_in_order() {
        let (queue, mut jobs) = LocalQueue::new();
        for lid in [1, 2] {
            queue
                .enqueue(IngestJob::Consume(ConsumeJob {
                    consume: RawConsume {
                        user_id: 1,
                        user_name: "a".to_string(),
                        amount: 1,
                    },
                    lid,
                }))
                .await
                .unwrap();
        }

        let lids: Vec<i64> = [jobs.recv().await.unwrap(), jobs.recv().await.unwrap()]
            .into_iter()
            .map(|job| match job {
                IngestJob::Consume(job) => job.lid,
                IngestJob::Chat(_) => unreachable!(),
            })
            .collect();
        assert_eq!(lids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_local_queue_fails_when_worker_is_gone() {
        let (queue, jobs) = LocalQueue::new();
        drop(jobs);

        let result = queue
            .enqueue(IngestJob::Consume(ConsumeJob {
                consume: RawConsume {
                    user_id: 1,
                    user_name: "a".to_string(),
                    amount: 1,
                },
                lid: 1,
            }))
            .await;
        assert!(matches!(result, Err(SyncError::Queue(_))));
    }
}
