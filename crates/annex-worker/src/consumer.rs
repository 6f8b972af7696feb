//! Transform job consumer
//!
//! Single-channel consume loop over the durable transform queue. Every
//! delivery is acknowledged exactly once, on every path:
//!
//! - success: process, then ack
//! - retryable failure: republish with an incremented attempt header, then
//!   ack the original
//! - exhausted budget or undecodable payload: publish to the dead-letter
//!   queue, then ack
//!
//! Prefetch is one, so at most one job is in flight per worker process and
//! unacknowledged deliveries are redelivered if the worker dies mid-job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use annex_common::types::{TransformJob, TRANSFORM_DEAD_QUEUE, TRANSFORM_QUEUE};

use crate::config::WorkerConfig;
use crate::fetcher::Fetcher;
use crate::transform::Transform;

/// Delivery attempt counter carried across republishes.
const ATTEMPTS_HEADER: &str = "x-attempts";

pub struct JobConsumer {
    conn: Connection,
    fetcher: Fetcher,
    transform: Arc<dyn Transform>,
    config: WorkerConfig,
}

impl JobConsumer {
    pub async fn connect(
        config: WorkerConfig,
        fetcher: Fetcher,
        transform: Arc<dyn Transform>,
    ) -> Result<Self> {
        let conn = Connection::connect(&config.mq_url, ConnectionProperties::default())
            .await
            .context("Failed to connect to message broker")?;

        info!("Connected to message broker");

        Ok(Self {
            conn,
            fetcher,
            transform,
            config,
        })
    }

    /// Consume until `shutdown` is cancelled or the broker closes the
    /// stream. The in-flight delivery finishes before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let channel = self
            .conn
            .create_channel()
            .await
            .context("Failed to open channel")?;

        declare_durable(&channel, TRANSFORM_QUEUE).await?;
        declare_durable(&channel, TRANSFORM_DEAD_QUEUE).await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set prefetch")?;

        // Republishes on the retry path must be broker-confirmed before the
        // original delivery is acked.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        let mut consumer = channel
            .basic_consume(
                TRANSFORM_QUEUE,
                "annex-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        info!("Consuming from queue '{}'", TRANSFORM_QUEUE);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    break;
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.handle_delivery(&channel, delivery).await {
                            // Channel-level failure; the unacked delivery
                            // will be redelivered.
                            error!("Failed to settle delivery: {:#}", err);
                        }
                    }
                    Some(Err(err)) => {
                        error!("Consumer stream error: {}", err);
                        break;
                    }
                    None => {
                        warn!("Consumer stream closed by broker");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Decode, process, and settle one delivery.
    async fn handle_delivery(&self, channel: &Channel, delivery: Delivery) -> Result<()> {
        let job: TransformJob = match serde_json::from_slice(&delivery.data) {
            Ok(job) => job,
            Err(err) => {
                // Undecodable payloads can never succeed; straight to the
                // dead-letter queue with the raw bytes intact.
                warn!("Dropping undecodable job to dead-letter queue: {}", err);
                publish_raw(channel, TRANSFORM_DEAD_QUEUE, &delivery.data, 0).await?;
                delivery.ack(BasicAckOptions::default()).await?;
                return Ok(());
            }
        };

        match self.process(&job).await {
            Ok(()) => {
                info!(
                    dataset_id = job.dataset.id,
                    dataset = %job.dataset.name,
                    "Job processed"
                );
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Err(err) => {
                warn!(
                    dataset_id = job.dataset.id,
                    error = %format!("{:#}", err),
                    "Job failed"
                );
                self.retry_or_dead(channel, &delivery).await?;
            }
        }

        Ok(())
    }

    /// Fetch the job's objects into a per-job directory, run the transform,
    /// and remove the directory whatever the outcome.
    #[instrument(skip(self, job), fields(dataset_id = job.dataset.id, keys = job.keys.len()))]
    async fn process(&self, job: &TransformJob) -> Result<()> {
        let job_dir = self.config.work_root.join(format!("job-{}", job.dataset.id));
        tokio::fs::create_dir_all(&job_dir)
            .await
            .with_context(|| format!("Failed to create {}", job_dir.display()))?;

        let result = self.fetch_and_transform(job, &job_dir).await;

        if let Err(err) = tokio::fs::remove_dir_all(&job_dir).await {
            warn!(
                dir = %job_dir.display(),
                error = %err,
                "Failed to remove job directory"
            );
        }

        result
    }

    async fn fetch_and_transform(&self, job: &TransformJob, job_dir: &std::path::Path) -> Result<()> {
        let cancel = CancellationToken::new();
        let outcome = self
            .fetcher
            .fetch_batch(&job.keys, job_dir, self.config.fan_out_limit, &cancel)
            .await;

        if let Some(err) = outcome.first_error {
            let completed = outcome.slots.iter().flatten().count();
            warn!(
                completed,
                total = job.keys.len(),
                "Fetch incomplete, failing job"
            );
            return Err(err);
        }

        let files: Vec<PathBuf> = outcome.slots.into_iter().flatten().collect();
        self.transform.run(job, &files).await
    }

    /// Requeue with an incremented attempt header, or dead-letter once the
    /// budget is spent. The original delivery is acked either way; the
    /// republished copy is the one that lives on.
    async fn retry_or_dead(&self, channel: &Channel, delivery: &Delivery) -> Result<()> {
        let attempts = attempts_from(delivery.properties.headers().as_ref());
        let next = attempts + 1;

        if next < self.config.max_attempts {
            let delay = backoff_delay(
                attempts,
                self.config.backoff_base_secs,
                self.config.backoff_cap_secs,
            );
            info!(
                attempt = next,
                max_attempts = self.config.max_attempts,
                delay_secs = delay.as_secs(),
                "Requeueing failed job"
            );
            // In-line delay; with prefetch one nothing else is waiting on
            // this consumer.
            tokio::time::sleep(delay).await;
            publish_raw(channel, TRANSFORM_QUEUE, &delivery.data, next).await?;
        } else {
            warn!(
                attempts = next,
                "Attempt budget exhausted, dead-lettering job"
            );
            publish_raw(channel, TRANSFORM_DEAD_QUEUE, &delivery.data, next).await?;
        }

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare queue '{queue}'"))?;
    Ok(())
}

/// Persistent publish of `body` to `queue` with the attempt header set.
async fn publish_raw(channel: &Channel, queue: &str, body: &[u8], attempts: u32) -> Result<()> {
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            props_with_attempts(attempts),
        )
        .await
        .with_context(|| format!("Failed to publish to '{queue}'"))?
        .await
        .with_context(|| format!("Publish to '{queue}' not confirmed"))?;
    Ok(())
}

fn props_with_attempts(attempts: u32) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(ATTEMPTS_HEADER.into(), AMQPValue::LongInt(attempts as i32));

    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_headers(headers)
}

/// Attempt count carried by a delivery; zero when absent or malformed.
fn attempts_from(headers: Option<&FieldTable>) -> u32 {
    let Some(headers) = headers else {
        return 0;
    };

    match headers.inner().get(ATTEMPTS_HEADER) {
        Some(AMQPValue::LongInt(n)) => (*n).max(0) as u32,
        Some(AMQPValue::LongLongInt(n)) => (*n).clamp(0, u32::MAX as i64) as u32,
        Some(AMQPValue::ShortInt(n)) => (*n).max(0) as u32,
        _ => 0,
    }
}

/// Exponential backoff for the given completed attempt count, capped.
fn backoff_delay(attempts: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = attempts.min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(cap_secs);
    Duration::from_secs(secs)
}
