//! Broker abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{QueueError, QueueTopology};

/// Stream of deliveries from one consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// A message broker that can open topology-ready channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// "amqp" or "memory"
    fn backend_name(&self) -> &'static str;

    /// Connect, open a channel, apply prefetch and declare `topology`.
    async fn connect(&self, topology: &QueueTopology) -> Result<Arc<dyn BrokerChannel>, QueueError>;
}

/// An open channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish a persistent JSON message to the exchange under `routing_key`.
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError>;

    /// Resolves with a reason once the underlying connection closes.
    async fn closed(&self) -> String;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Acknowledgement handle for a single delivery
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// One message received from a queue
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            delivery_tag,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .finish()
    }
}
