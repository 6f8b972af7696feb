//! Durable job queue publisher
//!
//! One long-lived AMQP connection, one short-lived channel per operation.
//! Queues are declared durable and messages are published persistent to the
//! default exchange, so a published job survives a broker restart. Publish
//! waits for broker confirmation before returning.

use std::sync::Arc;

use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    BasicProperties, Connection, ConnectionProperties,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;

pub use config::MqConfig;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("Failed to connect to message broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("Failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("Failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish to queue '{queue}': {source}")]
    Publish {
        queue: String,
        #[source]
        source: lapin::Error,
    },
}

pub type MqResult<T> = Result<T, MqError>;

#[derive(Clone)]
pub struct JobPublisher {
    conn: Arc<Connection>,
}

impl JobPublisher {
    pub async fn connect(config: &MqConfig) -> MqResult<Self> {
        let conn = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(MqError::Connect)?;

        info!("Connected to message broker");

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    /// Declare `queue` durable and non-auto-delete. Idempotent; redeclaring
    /// with the same options is a no-op on the broker.
    #[instrument(skip(self))]
    pub async fn declare_queue(&self, queue: &str) -> MqResult<()> {
        let channel = self.conn.create_channel().await.map_err(MqError::Channel)?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                Default::default(),
            )
            .await
            .map_err(|source| MqError::Declare {
                queue: queue.to_string(),
                source,
            })?;

        debug!("Declared durable queue '{}'", queue);

        Ok(())
    }

    /// Publish `payload` as persistent JSON to `queue` via the default
    /// exchange, stamped with the publish time. Returns once the broker
    /// confirms the message.
    #[instrument(skip(self, payload))]
    pub async fn publish<T: Serialize>(&self, queue: &str, payload: &T) -> MqResult<()> {
        let body = serde_json::to_vec(payload)?;

        let channel = self.conn.create_channel().await.map_err(MqError::Channel)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(MqError::Channel)?;

        let timestamp = chrono::Utc::now().timestamp() as u64;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(timestamp);

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|source| MqError::Publish {
                queue: queue.to_string(),
                source,
            })?
            .await
            .map_err(|source| MqError::Publish {
                queue: queue.to_string(),
                source,
            })?;

        debug!("Published {} bytes to queue '{}'", body.len(), queue);

        Ok(())
    }
}
