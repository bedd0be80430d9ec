use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::guard::GuardError;
use crate::notification::{GatewayError, ValidationError};
use crate::queue::QueueError;
use crate::resilience::{CircuitOpenError, RetryError, Retryable};
use crate::template::TemplateError;

/// Service-level errors surfaced during startup and by the HTTP surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Guard store error: {0}")]
    Guard(#[from] GuardError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a single notification job did not complete.
///
/// Everything the orchestrator can fail with funnels into this type; the
/// queue transport turns it into a dead-letter entry.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("invalid notification: {0}")]
    Validation(#[from] ValidationError),

    #[error("rate limit exceeded for user {user_id} ({limit} per window)")]
    RateLimited { user_id: String, limit: u64 },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("push gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("all {failed} devices failed{}", .last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    AllDevicesFailed {
        failed: usize,
        last_error: Option<String>,
    },

    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl DeliveryError {
    /// Stable code used as the dead-letter `reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "validation_failed",
            DeliveryError::RateLimited { .. } => "rate_limit_exceeded",
            DeliveryError::Template(_) => "template_error",
            DeliveryError::Gateway(_) => "gateway_error",
            DeliveryError::CircuitOpen(_) => "circuit_open",
            DeliveryError::AllDevicesFailed { .. } => "all_devices_failed",
            DeliveryError::Retry(RetryError::MaxRetriesExceeded { .. }) => "max_retries_exceeded",
            DeliveryError::Retry(RetryError::Cancelled) => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Gateway(_)
                | DeliveryError::CircuitOpen(_)
                | DeliveryError::AllDevicesFailed { .. }
        )
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        DeliveryError::is_retryable(self)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_ERROR"),
            AppError::Guard(_) => (StatusCode::SERVICE_UNAVAILABLE, "GUARD_STORE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let log_message = self.to_string();
        let client_message = if is_production() {
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            log_message.clone()
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::Gateway(GatewayError::Timeout).is_retryable());
        assert!(DeliveryError::CircuitOpen(CircuitOpenError {
            breaker: "push_gateway".into()
        })
        .is_retryable());
        assert!(DeliveryError::AllDevicesFailed {
            failed: 2,
            last_error: None
        }
        .is_retryable());

        assert!(!DeliveryError::Validation(ValidationError::MissingId).is_retryable());
        assert!(!DeliveryError::RateLimited {
            user_id: "u1".into(),
            limit: 10
        }
        .is_retryable());
        assert!(!DeliveryError::Retry(RetryError::Cancelled).is_retryable());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            DeliveryError::Validation(ValidationError::NoDeviceTokens).reason(),
            "validation_failed"
        );
        assert_eq!(
            DeliveryError::Retry(RetryError::MaxRetriesExceeded { attempts: 3 }).reason(),
            "max_retries_exceeded"
        );
        assert_eq!(
            DeliveryError::Template(TemplateError::NotFound("welcome".into())).reason(),
            "template_error"
        );
    }

    #[test]
    fn test_all_devices_failed_message() {
        let err = DeliveryError::AllDevicesFailed {
            failed: 2,
            last_error: Some("invalid token".into()),
        };
        assert_eq!(err.to_string(), "all 2 devices failed: invalid token");

        let err = DeliveryError::AllDevicesFailed {
            failed: 1,
            last_error: None,
        };
        assert_eq!(err.to_string(), "all 1 devices failed");
    }

    #[test]
    fn test_app_error_status() {
        let response = AppError::Internal("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = AppError::Queue(QueueError::NotConnected).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
