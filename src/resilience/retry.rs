//! Bounded exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::metrics::DeliveryMetrics;

/// Errors produced by the retry engine itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("max retries exceeded ({attempts} attempts)")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("retry cancelled")]
    Cancelled,
}

/// Classifies an error for the retry engine.
pub trait Retryable {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_secs(settings.initial_interval_secs),
            max_backoff: Duration::from_secs(settings.max_interval_secs),
            multiplier: settings.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay after the 0-indexed `attempt`: `min(initial * multiplier^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `operation` until it succeeds, fails permanently, the attempt
    /// budget is spent, or `cancel` fires while waiting between attempts.
    ///
    /// `starting_attempt` is the number of attempts already spent on this
    /// unit of work; the closure receives the 0-indexed attempt it is
    /// running. On exhaustion the last operation error is returned.
    pub async fn retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        starting_attempt: u32,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RetryError> + Retryable + std::fmt::Display,
    {
        if starting_attempt >= self.max_attempts {
            return Err(RetryError::MaxRetriesExceeded {
                attempts: starting_attempt,
            }
            .into());
        }

        let mut attempt = starting_attempt;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt + 1 >= self.max_attempts {
                tracing::warn!(
                    attempts = attempt + 1,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(error);
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            DeliveryMetrics::record_retry();

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(attempt = attempt, "Retry wait cancelled");
                    return Err(RetryError::Cancelled.into());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
