//! Supervised broker connection, bounded consumer and publishers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::RabbitMqConfig;
use crate::error::DeliveryError;
use crate::health::{DependencyHealth, HealthCheckable};
use crate::metrics::QueueMetrics;
use crate::notification::{DeadLetterEntry, NotificationJob, StatusReport};

use super::broker::{Broker, BrokerChannel, Delivery};
use super::{MessageHandler, QueueError, QueueTopology, StatusPublisher};

/// Connection state broadcast by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Closed,
}

#[derive(Default)]
struct TransportStats {
    received: AtomicU64,
    completed: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    reconnections: AtomicU64,
}

/// Point-in-time view of transport counters
#[derive(Debug, Clone, Serialize)]
pub struct TransportStatsSnapshot {
    pub state: ConnectionState,
    pub backend: &'static str,
    pub prefetch_count: u16,
    pub received: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub reconnections: u64,
}

/// Owns the broker channel for the lifetime of the service.
///
/// At most `prefetch_count` deliveries are processed at once. A lost
/// connection is re-established by the supervisor task; the consumer
/// waits for it and resumes on the fresh channel.
pub struct QueueTransport {
    broker: Arc<dyn Broker>,
    topology: QueueTopology,
    reconnect_delay: Duration,
    consumer_tag: String,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    reconnect_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    stats: TransportStats,
}

impl QueueTransport {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: QueueTopology,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            topology,
            reconnect_delay,
            consumer_tag: format!("ara-push-{}", uuid::Uuid::new_v4()),
            channel: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            state_tx,
            shutdown,
            stats: TransportStats::default(),
        }
    }

    pub fn from_config(
        broker: Arc<dyn Broker>,
        config: &RabbitMqConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(
            broker,
            QueueTopology::from(config),
            Duration::from_secs(config.reconnect_delay_secs),
            shutdown,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Establish the first connection and declare topology.
    pub async fn connect(&self) -> Result<(), QueueError> {
        let _guard = self.reconnect_lock.lock().await;
        let channel = self.broker.connect(&self.topology).await?;
        self.install(channel).await;
        tracing::info!(
            backend = self.broker.backend_name(),
            push_queue = %self.topology.push_queue,
            "Connected to broker"
        );
        Ok(())
    }

    async fn install(&self, channel: Arc<dyn BrokerChannel>) {
        *self.channel.write().await = Some(channel);
        self.state_tx.send_replace(ConnectionState::Connected);
        QueueMetrics::set_connected(true);
    }

    async fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.read().await.clone()
    }

    /// Mark `lost` as gone. A channel that was already replaced is ignored.
    async fn channel_lost(&self, lost: &Arc<dyn BrokerChannel>, reason: &str) {
        let mut current = self.channel.write().await;
        let is_current = current
            .as_ref()
            .map(|c| Arc::ptr_eq(c, lost))
            .unwrap_or(false);
        if !is_current {
            return;
        }

        *current = None;
        drop(current);

        if self.shutdown.is_cancelled() {
            return;
        }
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        QueueMetrics::set_connected(false);
        tracing::error!(reason = %reason, "Broker connection lost");
    }

    /// Spawn the task that watches the connection and reconnects after loss.
    pub fn start_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.supervise().await })
    }

    async fn supervise(&self) {
        let mut state_rx = self.state_tx.subscribe();

        loop {
            if let Some(channel) = self.current_channel().await {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    reason = channel.closed() => {
                        self.channel_lost(&channel, &reason).await;
                    }
                    _ = async {
                        let _ = state_rx.wait_for(|s| *s != ConnectionState::Connected).await;
                    } => {}
                }
            }

            if self.shutdown.is_cancelled() || !self.reconnect().await {
                break;
            }
        }

        tracing::debug!("Broker supervisor stopped");
    }

    /// Reconnect until it succeeds. Returns false only when shut down first.
    async fn reconnect(&self) -> bool {
        let _guard = self.reconnect_lock.lock().await;

        if let Some(channel) = self.current_channel().await {
            if channel.is_open() {
                return true;
            }
        }

        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            attempt += 1;

            match self.broker.connect(&self.topology).await {
                Ok(channel) => {
                    self.install(channel).await;
                    self.stats.reconnections.fetch_add(1, Ordering::Relaxed);
                    QueueMetrics::record_reconnection();
                    tracing::info!(attempt = attempt, "Reconnected to broker");
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        attempt = attempt,
                        error = %e,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Broker reconnect failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Wait until a live channel is installed. `None` once shut down.
    async fn wait_connected(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(channel) = self.current_channel().await {
                return Some(channel);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Consume the push queue until shutdown, handing each job to `handler`.
    ///
    /// Returns after every in-flight delivery has been settled.
    pub async fn consume(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) {
        let permits = Arc::new(Semaphore::new(self.topology.prefetch_count.max(1) as usize));
        let mut in_flight = JoinSet::new();

        'connection: while let Some(channel) = self.wait_connected().await {
            let mut deliveries = match channel
                .consume(&self.topology.push_queue, &self.consumer_tag)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to start consumer");
                    self.channel_lost(&channel, &e.to_string()).await;
                    continue;
                }
            };

            tracing::info!(
                queue = %self.topology.push_queue,
                consumer_tag = %self.consumer_tag,
                prefetch = self.topology.prefetch_count,
                "Consumer started"
            );

            loop {
                while let Some(joined) = in_flight.try_join_next() {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Delivery task panicked");
                    }
                }

                let permit = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'connection,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'connection,
                    },
                };

                let next = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'connection,
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        let transport = Arc::clone(self);
                        let handler = Arc::clone(&handler);
                        in_flight.spawn(async move {
                            transport.handle_delivery(delivery, handler.as_ref()).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        self.channel_lost(&channel, &e.to_string()).await;
                        break;
                    }
                    None => {
                        self.channel_lost(&channel, "consumer stream ended").await;
                        break;
                    }
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            tracing::info!(pending = pending, "Waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
        tracing::info!("Consumer stopped");
    }

    /// Settle one delivery: reject if undecodable, otherwise run the handler
    /// and ack, dead-lettering first when the handler fails.
    async fn handle_delivery(&self, delivery: Delivery, handler: &dyn MessageHandler) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::record_received();

        let mut job: NotificationJob = match serde_json::from_slice(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                QueueMetrics::record_malformed();
                tracing::warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Malformed message rejected"
                );
                if let Err(e) = delivery.reject(false).await {
                    tracing::warn!(error = %e, "Failed to reject malformed message");
                }
                return;
            }
        };

        match handler.handle(&mut job, &self.shutdown).await {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if let Err(e) = self.publish_dead_letter(&job, &err).await {
                    tracing::error!(
                        notification_id = %job.id,
                        error = %e,
                        "Failed to publish dead letter"
                    );
                }
            }
        }

        if let Err(e) = delivery.ack().await {
            tracing::warn!(
                notification_id = %job.id,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }

    /// Serialize `message` and publish it under `routing_key`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        message: &T,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(message)?;
        let channel = self
            .current_channel()
            .await
            .ok_or(QueueError::NotConnected)?;

        match channel.publish(routing_key, payload).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                QueueMetrics::record_published(routing_key);
                Ok(())
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub async fn publish_dead_letter(
        &self,
        job: &NotificationJob,
        err: &DeliveryError,
    ) -> Result<(), QueueError> {
        let entry = DeadLetterEntry {
            original_message: job.clone(),
            reason: err.reason().to_string(),
            attempt_count: job.attempt_count,
            failed_at: Utc::now(),
            last_error: err.to_string(),
        };
        self.publish(&self.topology.failed_queue, &entry).await?;

        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::record_dead_lettered(err.reason());
        tracing::warn!(
            notification_id = %job.id,
            reason = err.reason(),
            attempt_count = job.attempt_count,
            error = %err,
            "Job dead-lettered"
        );
        Ok(())
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            state: self.state(),
            backend: self.broker.backend_name(),
            prefetch_count: self.topology.prefetch_count,
            received: self.stats.received.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            reconnections: self.stats.reconnections.load(Ordering::Relaxed),
        }
    }

    /// Close the channel. Call after the consumer has drained.
    pub async fn close(&self) {
        let channel = self.channel.write().await.take();
        self.state_tx.send_replace(ConnectionState::Closed);
        QueueMetrics::set_connected(false);
        if let Some(channel) = channel {
            channel.close().await;
        }
        tracing::info!("Broker connection closed");
    }
}

#[async_trait]
impl StatusPublisher for QueueTransport {
    async fn publish_status(&self, report: &StatusReport) -> Result<(), QueueError> {
        self.publish(&self.topology.status_queue, report).await
    }
}

#[async_trait]
impl HealthCheckable for QueueTransport {
    fn name(&self) -> &str {
        "queue_transport"
    }

    async fn check_health(&self) -> DependencyHealth {
        match self.state() {
            ConnectionState::Connected => match self.current_channel().await {
                Some(channel) if channel.is_open() => DependencyHealth::healthy(),
                _ => DependencyHealth::unhealthy("channel closed"),
            },
            ConnectionState::Disconnected => DependencyHealth::unhealthy("reconnecting"),
            ConnectionState::Closed => DependencyHealth::unhealthy("closed"),
        }
    }
}
