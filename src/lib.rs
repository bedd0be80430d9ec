// Ambient stack
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod telemetry;

// Delivery core
pub mod guard;
pub mod notification;
pub mod queue;
pub mod resilience;
pub mod template;

// Operational HTTP surface
pub mod api;
pub mod server;
