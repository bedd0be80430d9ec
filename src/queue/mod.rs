//! Durable queue transport.
//!
//! # Architecture
//!
//! The broker client sits behind the [`Broker`] / [`BrokerChannel`] traits:
//!
//! - `AmqpBroker`: RabbitMQ via `lapin` (production)
//! - `MemoryBroker`: in-process queues for tests and local runs
//!
//! [`QueueTransport`] owns the active channel. It declares topology,
//! consumes the push queue with bounded concurrency, publishes status and
//! dead-letter messages, and reconnects whenever the channel is lost.
//!
//! Use `create_broker()` to pick the backend from configuration.

mod amqp;
mod broker;
mod memory;
mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RabbitMqConfig;
use crate::error::DeliveryError;
use crate::notification::{NotificationJob, StatusReport};

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerChannel, Delivery, DeliveryAcker, DeliveryStream};
pub use memory::MemoryBroker;
pub use transport::{ConnectionState, QueueTransport, TransportStatsSnapshot};

/// Error types for queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker operation failed: {0}")]
    Broker(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Failed to serialize message: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Exchange and queue names plus consumer prefetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub push_queue: String,
    pub failed_queue: String,
    pub status_queue: String,
    pub prefetch_count: u16,
}

impl QueueTopology {
    /// Every declared queue; each is bound to the exchange under its own name
    pub fn queues(&self) -> [&str; 3] {
        [&self.push_queue, &self.failed_queue, &self.status_queue]
    }
}

impl From<&RabbitMqConfig> for QueueTopology {
    fn from(config: &RabbitMqConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            push_queue: config.push_queue.clone(),
            failed_queue: config.failed_queue.clone(),
            status_queue: config.status_queue.clone(),
            prefetch_count: config.prefetch_count.max(1),
        }
    }
}

/// Processes one decoded job taken from the push queue.
///
/// The handler may update the job (e.g. its attempt counter); the updated
/// job is what gets dead-lettered when the handler fails.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        job: &mut NotificationJob,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;
}

/// Destination for job status reports
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(&self, report: &StatusReport) -> Result<(), QueueError>;
}

/// Create a broker based on configuration
pub fn create_broker(config: &RabbitMqConfig) -> Arc<dyn Broker> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!("Using in-memory broker");
            Arc::new(MemoryBroker::new())
        }
        other => {
            if other != "amqp" {
                tracing::warn!(backend = %other, "Unknown queue backend, using amqp");
            }
            tracing::info!(exchange = %config.exchange, "Using AMQP broker");
            Arc::new(AmqpBroker::new(config.url.clone()))
        }
    }
}
