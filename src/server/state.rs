use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::health::HealthRegistry;
use crate::notification::DeliveryOrchestrator;
use crate::queue::QueueTransport;

/// Shared handles for the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub health: HealthRegistry,
    pub orchestrator: Arc<DeliveryOrchestrator>,
    pub transport: Arc<QueueTransport>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        health: HealthRegistry,
        orchestrator: Arc<DeliveryOrchestrator>,
        transport: Arc<QueueTransport>,
    ) -> Self {
        Self {
            settings,
            health,
            orchestrator,
            transport,
            start_time: Instant::now(),
        }
    }
}
