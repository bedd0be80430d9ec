//! Notification jobs and their delivery.
//!
//! - `types`: wire model for jobs, status reports and dead-letter entries
//! - `gateway`: the push gateway seam and its HTTP client
//! - `orchestrator`: the per-job pipeline driven by the queue transport

mod gateway;
mod orchestrator;
mod types;

pub use gateway::{GatewayError, HttpPushGateway, PushGateway};
pub use orchestrator::{
    DeliveryOrchestrator, OrchestratorStats, OrchestratorStatsSnapshot, MULTICAST_BATCH_LIMIT,
};
pub use types::{
    DataMap, DeadLetterEntry, DeliveryOutcome, NotificationJob, NotificationStatus, Priority,
    PushContent, StatusReport, ValidationError,
};
