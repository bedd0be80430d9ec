//! Prometheus metrics for the push service.
//!
//! - Job metrics (received, processed by outcome, dead-lettered)
//! - Guard metrics (rate limited, duplicates, store errors)
//! - Device send metrics and retry attempts
//! - Circuit breaker state and rejections
//! - Broker connection and publish metrics

mod helpers;

pub use helpers::{encode_metrics, CircuitBreakerMetrics, DeliveryMetrics, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "push";

lazy_static! {
    // ============================================================================
    // Job Metrics
    // ============================================================================

    /// Jobs taken off the push queue (including malformed ones)
    pub static ref JOBS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_received_total", METRIC_PREFIX),
        "Total jobs received from the push queue"
    ).expect("register push_jobs_received_total");

    /// Jobs that reached a terminal outcome
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_processed_total", METRIC_PREFIX),
        "Total jobs processed by outcome",
        &["outcome"]
    ).expect("register push_jobs_processed_total");

    /// Jobs written to the dead-letter queue
    pub static ref JOBS_DEAD_LETTERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_dead_lettered_total", METRIC_PREFIX),
        "Total jobs dead-lettered by reason",
        &["reason"]
    ).expect("register push_jobs_dead_lettered_total");

    /// Job processing latency, from delivery to terminal outcome
    pub static ref JOB_PROCESSING_SECONDS: Histogram = register_histogram!(
        format!("{}_job_processing_seconds", METRIC_PREFIX),
        "Job processing latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("register push_job_processing_seconds");

    // ============================================================================
    // Guard Metrics
    // ============================================================================

    pub static ref RATE_LIMITED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_rate_limited_total", METRIC_PREFIX),
        "Total jobs rejected by the per-user rate limit"
    ).expect("register push_rate_limited_total");

    pub static ref DUPLICATES_SUPPRESSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_duplicates_suppressed_total", METRIC_PREFIX),
        "Total jobs suppressed as duplicates"
    ).expect("register push_duplicates_suppressed_total");

    /// Guard store failures (each one let the job through)
    pub static ref GUARD_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_guard_errors_total", METRIC_PREFIX),
        "Total guard store errors by operation",
        &["operation"]
    ).expect("register push_guard_errors_total");

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    pub static ref DEVICE_SENDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_device_sends_total", METRIC_PREFIX),
        "Total per-device send results",
        &["result"]
    ).expect("register push_device_sends_total");

    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retry_attempts_total", METRIC_PREFIX),
        "Total retry backoffs scheduled"
    ).expect("register push_retry_attempts_total");

    // ============================================================================
    // Circuit Breaker Metrics
    // ============================================================================

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["breaker"]
    ).expect("register push_circuit_breaker_state");

    pub static ref CIRCUIT_BREAKER_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_circuit_breaker_rejections_total", METRIC_PREFIX),
        "Total calls rejected by an open circuit",
        &["breaker"]
    ).expect("register push_circuit_breaker_rejections_total");

    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Broker connection status (1 = connected, 0 = disconnected)
    pub static ref BROKER_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_broker_connected", METRIC_PREFIX),
        "Broker connection status (1=connected, 0=disconnected)"
    ).expect("register push_broker_connected");

    pub static ref BROKER_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_reconnections_total", METRIC_PREFIX),
        "Total successful broker reconnections"
    ).expect("register push_broker_reconnections_total");

    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_published_total", METRIC_PREFIX),
        "Total messages published by queue",
        &["queue"]
    ).expect("register push_messages_published_total");

    pub static ref MESSAGES_MALFORMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_malformed_total", METRIC_PREFIX),
        "Total undecodable messages rejected without requeue"
    ).expect("register push_messages_malformed_total");
}
