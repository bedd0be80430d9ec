//! Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::error::{AppError, Result};
use crate::metrics::{self, CircuitBreakerMetrics, QueueMetrics};
use crate::queue::ConnectionState;
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    refresh_gauges(&state);

    let output = metrics::encode_metrics()
        .map_err(|e| AppError::Internal(format!("failed to encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}

/// Gauges that are only updated on transitions start out unset
fn refresh_gauges(state: &AppState) {
    let breaker = state.orchestrator.breaker();
    CircuitBreakerMetrics::set_state(breaker.name(), breaker.state());
    QueueMetrics::set_connected(state.transport.state() == ConnectionState::Connected);
}
