//! Failure isolation for calls to remote dependencies.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitOpenError, CircuitState,
};
pub use retry::{RetryError, RetryPolicy, Retryable};
