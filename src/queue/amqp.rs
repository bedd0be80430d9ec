//! RabbitMQ broker over `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;

use super::broker::{Broker, BrokerChannel, Delivery, DeliveryAcker, DeliveryStream};
use super::{QueueError, QueueTopology};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Broker(e.to_string())
    }
}

pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn backend_name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self, topology: &QueueTopology) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |err| {
            let _ = closed_tx.send(Some(err.to_string()));
        });

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(topology.prefetch_count, BasicQosOptions::default())
            .await?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for queue in topology.queues() {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        tracing::info!(
            exchange = %topology.exchange,
            prefetch = topology.prefetch_count,
            "AMQP topology declared"
        );

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            exchange: topology.exchange.clone(),
            closed_rx,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    exchange: String,
    closed_rx: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|result| {
                result.map_err(QueueError::from).map(|delivery| {
                    Delivery::new(
                        delivery.delivery_tag,
                        delivery.data,
                        Box::new(AmqpAcker(delivery.acker)),
                    )
                })
            })
            .boxed())
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        let waited = rx
            .wait_for(|reason| reason.is_some())
            .await
            .map(|reason| reason.clone());
        match waited {
            Ok(reason) => reason.unwrap_or_default(),
            Err(_) => "connection error watcher dropped".to_string(),
        }
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            tracing::debug!(error = %e, "AMQP connection close failed");
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
