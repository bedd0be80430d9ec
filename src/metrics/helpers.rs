//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::notification::NotificationStatus;
use crate::resilience::CircuitState;

use super::{
    BROKER_CONNECTED, BROKER_RECONNECTIONS_TOTAL, CIRCUIT_BREAKER_REJECTIONS_TOTAL,
    CIRCUIT_BREAKER_STATE, DEVICE_SENDS_TOTAL, DUPLICATES_SUPPRESSED_TOTAL, GUARD_ERRORS_TOTAL,
    JOBS_DEAD_LETTERED_TOTAL, JOBS_PROCESSED_TOTAL, JOBS_RECEIVED_TOTAL, JOB_PROCESSING_SECONDS,
    MESSAGES_MALFORMED_TOTAL, MESSAGES_PUBLISHED_TOTAL, RATE_LIMITED_TOTAL, RETRY_ATTEMPTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording job delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// Record a job that reached a terminal status
    pub fn record_outcome(status: NotificationStatus, elapsed: Duration) {
        JOBS_PROCESSED_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        JOB_PROCESSING_SECONDS.observe(elapsed.as_secs_f64());
    }

    pub fn record_duplicate() {
        DUPLICATES_SUPPRESSED_TOTAL.inc();
        JOBS_PROCESSED_TOTAL.with_label_values(&["duplicate"]).inc();
    }

    pub fn record_rate_limited() {
        RATE_LIMITED_TOTAL.inc();
    }

    /// Record per-device results of one send attempt
    pub fn record_devices(succeeded: u64, failed: u64) {
        DEVICE_SENDS_TOTAL
            .with_label_values(&["success"])
            .inc_by(succeeded);
        DEVICE_SENDS_TOTAL
            .with_label_values(&["failure"])
            .inc_by(failed);
    }

    pub fn record_retry() {
        RETRY_ATTEMPTS_TOTAL.inc();
    }

    pub fn record_guard_error(operation: &str) {
        GUARD_ERRORS_TOTAL.with_label_values(&[operation]).inc();
    }
}

/// Helper struct for recording broker/transport metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_received() {
        JOBS_RECEIVED_TOTAL.inc();
    }

    pub fn record_malformed() {
        MESSAGES_MALFORMED_TOTAL.inc();
    }

    pub fn record_dead_lettered(reason: &str) {
        JOBS_DEAD_LETTERED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_published(queue: &str) {
        MESSAGES_PUBLISHED_TOTAL.with_label_values(&[queue]).inc();
    }

    pub fn set_connected(connected: bool) {
        BROKER_CONNECTED.set(if connected { 1 } else { 0 });
    }

    pub fn record_reconnection() {
        BROKER_RECONNECTIONS_TOTAL.inc();
    }
}

/// Helper struct for recording circuit breaker metrics
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    pub fn set_state(breaker: &str, state: CircuitState) {
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[breaker])
            .set(state.as_gauge());
    }

    pub fn record_rejected(breaker: &str) {
        CIRCUIT_BREAKER_REJECTIONS_TOTAL
            .with_label_values(&[breaker])
            .inc();
    }
}
