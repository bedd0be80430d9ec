//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::health::NamedHealth;
use crate::notification::OrchestratorStatsSnapshot;
use crate::queue::TransportStatsSnapshot;
use crate::resilience::CircuitBreakerStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub dependencies: Vec<NamedHealth>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub circuit_breaker: CircuitBreakerStats,
    pub delivery: OrchestratorStatsSnapshot,
    pub transport: TransportStatsSnapshot,
}

/// GET /health - 200 when every dependency is healthy, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.health.report().await;
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: report.status,
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            dependencies: report.dependencies,
        }),
    )
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        circuit_breaker: state.orchestrator.breaker().stats(),
        delivery: state.orchestrator.stats(),
        transport: state.transport.stats(),
    })
}
