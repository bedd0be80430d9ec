//! Idempotency and per-user rate limiting backed by a shared key-value store.
//!
//! Store failures never block delivery: every guard check fails open and
//! logs a warning instead.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryGuardStore;
pub use redis_store::RedisGuardStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{RateLimitConfig, RedisConfig};
use crate::health::{DependencyHealth, HealthCheckable};
use crate::metrics::DeliveryMetrics;

/// How long a processed marker suppresses redeliveries.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const PROCESSED_MARKER: &str = "processed";

pub fn idempotency_key(notification_id: &str) -> String {
    format!("idempotency:notification:{}", notification_id)
}

pub fn rate_limit_key(user_id: &str) -> String {
    format!("ratelimit:user:{}", user_id)
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Guard store unavailable: {0}")]
    Unavailable(String),

    /// The stored value could not be read as the expected type
    #[error("Malformed value at key '{key}': {detail}")]
    MalformedValue { key: String, detail: String },
}

/// Key-value primitives the guard needs from its backing store.
#[async_trait]
pub trait GuardStore: HealthCheckable {
    async fn exists(&self, key: &str) -> Result<bool, GuardError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), GuardError>;

    /// Atomically increment the counter at `key`, starting its expiry
    /// window when the counter is created. Returns the post-increment count.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, GuardError>;
}

/// Create a guard store based on configuration
pub fn create_guard_store(config: &RedisConfig) -> Result<Arc<dyn GuardStore>, GuardError> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!("Using in-memory guard store");
            Ok(Arc::new(MemoryGuardStore::new()))
        }
        other => {
            if other != "redis" {
                tracing::warn!(backend = %other, "Unknown guard store backend, using redis");
            }
            tracing::info!(url = %config.url, "Using Redis guard store");
            Ok(Arc::new(RedisGuardStore::new(&config.url)?))
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Exceeded { count: u64, limit: u64 },
}

/// Duplicate suppression and abuse protection for notification jobs.
pub struct DeliveryGuard {
    store: Arc<dyn GuardStore>,
    limit: u64,
    window: Duration,
}

impl DeliveryGuard {
    pub fn new(store: Arc<dyn GuardStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            limit: config.requests,
            window: Duration::from_secs(config.window_secs),
        }
    }

    /// Count one request for `user_id` within the current window.
    pub async fn check_rate_limit(&self, user_id: &str) -> RateLimitDecision {
        let key = rate_limit_key(user_id);
        match self.store.increment_with_expiry(&key, self.window).await {
            Ok(count) if count > self.limit => RateLimitDecision::Exceeded {
                count,
                limit: self.limit,
            },
            Ok(_) => RateLimitDecision::Allowed,
            Err(e) => {
                DeliveryMetrics::record_guard_error("rate_limit");
                tracing::warn!(user_id = %user_id, error = %e, "Rate limit check failed, allowing request");
                RateLimitDecision::Allowed
            }
        }
    }

    /// Whether a live processed marker exists for `notification_id`.
    pub async fn is_duplicate(&self, notification_id: &str) -> bool {
        match self.store.exists(&idempotency_key(notification_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                DeliveryMetrics::record_guard_error("idempotency_check");
                tracing::warn!(
                    notification_id = %notification_id,
                    error = %e,
                    "Idempotency check failed, processing anyway"
                );
                false
            }
        }
    }

    /// Record that `notification_id` reached a terminal outcome.
    pub async fn mark_processed(&self, notification_id: &str) {
        let key = idempotency_key(notification_id);
        if let Err(e) = self
            .store
            .set_with_expiry(&key, PROCESSED_MARKER, IDEMPOTENCY_TTL)
            .await
        {
            DeliveryMetrics::record_guard_error("mark_processed");
            tracing::warn!(
                notification_id = %notification_id,
                error = %e,
                "Failed to mark notification as processed"
            );
        }
    }
}

#[async_trait]
impl HealthCheckable for DeliveryGuard {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn check_health(&self) -> DependencyHealth {
        self.store.check_health().await
    }
}
