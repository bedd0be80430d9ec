//! In-process broker.
//!
//! Queues live in memory and are lost on restart. Besides local runs this
//! backs the transport and pipeline tests, so it can also simulate
//! connection loss (`sever`) and failed reconnects (`fail_next_connects`).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};

use super::broker::{Broker, BrokerChannel, Delivery, DeliveryAcker, DeliveryStream};
use super::{QueueError, QueueTopology};

#[derive(Default)]
struct MemoryState {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    notify: Notify,
    current: Mutex<Option<Arc<MemoryChannel>>>,
    pending_connect_failures: AtomicU32,
    connects: AtomicU32,
    next_tag: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

impl MemoryState {
    fn push(&self, queue: &str, body: Vec<u8>, front: bool) -> bool {
        let delivered = {
            let mut queues = self.queues.lock();
            match queues.get_mut(queue) {
                Some(q) if front => {
                    q.push_front(body);
                    true
                }
                Some(q) => {
                    q.push_back(body);
                    true
                }
                None => false,
            }
        };
        if delivered {
            self.notify.notify_waiters();
        }
        delivered
    }

    fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.queues.lock().get_mut(queue).and_then(|q| q.pop_front())
    }
}

/// In-memory broker with a direct exchange where routing key == queue name.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body as if a producer had published it.
    pub fn push_raw(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.declare(queue);
        self.state.push(queue, body.into(), false);
    }

    pub fn push_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<(), QueueError> {
        self.push_raw(queue, serde_json::to_vec(message)?);
        Ok(())
    }

    /// Remove and return every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .queues
            .lock()
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drain `queue` and decode every message as `T`.
    pub fn drain_json<T: serde::de::DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.drain(queue)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state.queues.lock().get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Simulate the broker dropping the current connection.
    pub fn sever(&self, reason: &str) {
        if let Some(channel) = self.state.current.lock().take() {
            channel.shut(reason);
        }
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.pending_connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.state.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.state.rejected.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> u64 {
        self.state.requeued.load(Ordering::SeqCst)
    }

    fn declare(&self, queue: &str) {
        self.state
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, topology: &QueueTopology) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let failures = &self.state.pending_connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Connection("connection refused (simulated)".into()));
        }

        for queue in topology.queues() {
            self.declare(queue);
        }

        let (closed_tx, _) = watch::channel(None);
        let channel = Arc::new(MemoryChannel {
            state: self.state.clone(),
            closed_tx,
        });

        if let Some(previous) = self.state.current.lock().replace(channel.clone()) {
            previous.shut("replaced by new connection");
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(channel)
    }
}

struct MemoryChannel {
    state: Arc<MemoryState>,
    closed_tx: watch::Sender<Option<String>>,
}

impl MemoryChannel {
    fn shut(&self, reason: &str) {
        self.closed_tx.send_replace(Some(reason.to_string()));
        self.state.notify.notify_waiters();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        if !self.is_open() {
            return Err(QueueError::NotConnected);
        }
        if !self.state.push(routing_key, payload, false) {
            tracing::warn!(routing_key = %routing_key, "Unroutable message dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        if !self.is_open() {
            return Err(QueueError::NotConnected);
        }

        let state = self.state.clone();
        let closed = self.closed_tx.subscribe();
        let queue = queue.to_string();

        let stream = futures::stream::unfold(
            (state, closed, queue),
            |(state, mut closed, queue)| async move {
                loop {
                    let waker = state.clone();
                    let notified = waker.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if closed.borrow().is_some() {
                        return None;
                    }

                    if let Some(body) = state.pop(&queue) {
                        let tag = state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                        let acker = MemoryAcker {
                            state: state.clone(),
                            queue: queue.clone(),
                            body: body.clone(),
                        };
                        let delivery = Delivery::new(tag, body, Box::new(acker));
                        return Some((Ok(delivery), (state, closed, queue)));
                    }

                    tokio::select! {
                        _ = &mut notified => {}
                        changed = closed.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_tx.subscribe();
        let waited = rx
            .wait_for(|reason| reason.is_some())
            .await
            .map(|reason| reason.clone());
        match waited {
            Ok(reason) => reason.unwrap_or_default(),
            Err(_) => "channel dropped".to_string(),
        }
    }

    fn is_open(&self) -> bool {
        self.closed_tx.borrow().is_none()
    }

    async fn close(&self) {
        self.shut("closed by client");
    }
}

struct MemoryAcker {
    state: Arc<MemoryState>,
    queue: String,
    body: Vec<u8>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.state.requeued.fetch_add(1, Ordering::SeqCst);
            self.state.push(&self.queue, self.body.clone(), true);
        } else {
            self.state.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn topology() -> QueueTopology {
        QueueTopology {
            exchange: "ex".into(),
            push_queue: "push".into(),
            failed_queue: "failed".into(),
            status_queue: "status".into(),
            prefetch_count: 4,
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&topology()).await.unwrap();

        channel.publish("status", b"{}".to_vec()).await.unwrap();
        channel.publish("unknown", b"{}".to_vec()).await.unwrap();

        assert_eq!(broker.depth("status"), 1);
        assert_eq!(broker.depth("unknown"), 0);
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&topology()).await.unwrap();
        broker.push_raw("push", "one");

        let mut stream = channel.consume("push", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"one");
        delivery.ack().await.unwrap();

        assert_eq!(broker.acked(), 1);
        assert_eq!(broker.depth("push"), 0);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&topology()).await.unwrap();
        let mut stream = channel.consume("push", "test").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push_raw("push", "late");
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_reject_with_requeue_returns_to_front() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&topology()).await.unwrap();
        broker.push_raw("push", "a");
        broker.push_raw("push", "b");

        let mut stream = channel.consume("push", "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.reject(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert_eq!(broker.requeued(), 1);
    }

    #[tokio::test]
    async fn test_sever_ends_stream_and_fires_closed() {
        let broker = MemoryBroker::new();
        let channel = broker.connect(&topology()).await.unwrap();
        let mut stream = channel.consume("push", "test").await.unwrap();

        broker.sever("heartbeat timeout");

        assert!(stream.next().await.is_none());
        assert_eq!(channel.closed().await, "heartbeat timeout");
        assert!(!channel.is_open());
        assert_eq!(
            channel.publish("push", vec![]).await,
            Err(QueueError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_simulated_connect_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect(&topology()).await.is_err());
        assert!(broker.connect(&topology()).await.is_err());
        assert!(broker.connect(&topology()).await.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }
}
