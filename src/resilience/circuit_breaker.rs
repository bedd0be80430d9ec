//! Circuit breaker guarding calls to the push gateway.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CircuitBreakerSettings;
use crate::health::{DependencyHealth, HealthCheckable};
use crate::metrics::CircuitBreakerMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow through normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing trial requests
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used by the state gauge (0=closed, 1=open, 2=half-open)
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Returned instead of invoking the operation while the breaker refuses calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{breaker}' is open")]
pub struct CircuitOpenError {
    pub breaker: String,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Trial calls admitted while half-open, and successes needed to close
    pub max_requests: u32,
    /// Failures while closed before opening the circuit
    pub failure_threshold: u32,
    /// Closed-state window after which counters are forgiven
    pub interval: Duration,
    /// Time after the last failure before an open circuit admits a trial call
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            failure_threshold: 5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            failure_threshold: settings.failure_threshold,
            interval: Duration::from_secs(settings.interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    requests: u32,
    /// Start of the closed-state counting window
    window_start: Instant,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            requests: 0,
            window_start: Instant::now(),
            last_failure: None,
            last_failure_at: None,
            last_state_change_at: Utc::now(),
        }
    }

    fn reset_counters(&mut self) {
        self.failures = 0;
        self.successes = 0;
        self.requests = 0;
        self.window_start = Instant::now();
    }
}

/// Circuit breaker for a remote dependency.
///
/// One instance is shared by every concurrently processing job, so the
/// circuit is global per dependency. The lock only covers admission and
/// bookkeeping; the wrapped operation always runs outside of it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `operation` if the breaker currently admits calls.
    ///
    /// A rejected call never invokes `operation` and returns the
    /// [`CircuitOpenError`] converted into the caller's error type.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.before_call()?;
        let result = operation().await;
        self.after_call(result.is_ok());
        result
    }

    fn before_call(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                if now.duration_since(inner.window_start) > self.config.interval {
                    inner.reset_counters();
                }
                Ok(())
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map(|at| now.duration_since(at) > self.config.timeout)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.requests += 1;
                    Ok(())
                } else {
                    CircuitBreakerMetrics::record_rejected(&self.name);
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.requests >= self.config.max_requests {
                    CircuitBreakerMetrics::record_rejected(&self.name);
                    return Err(self.open_error());
                }
                inner.requests += 1;
                Ok(())
            }
        }
    }

    fn after_call(&self, success: bool) {
        let mut inner = self.inner.lock();

        if success {
            inner.successes += 1;
            if inner.state == CircuitState::HalfOpen && inner.successes >= self.config.max_requests
            {
                self.transition(&mut inner, CircuitState::Closed);
                tracing::info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
            }
            return;
        }

        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    let failures = inner.failures;
                    self.transition(&mut inner, CircuitState::Open);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(breaker = %self.name, "Circuit breaker reopened after failure in half-open state");
            }
            // A call admitted just before the circuit opened; keep the fresh failure time.
            CircuitState::Open => {}
        }
    }

    /// Move to `next`, resetting every counter. The failure timestamp survives
    /// so the open-state timeout is measured from the last failure.
    fn transition(&self, inner: &mut BreakerState, next: CircuitState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        inner.last_state_change_at = Utc::now();
        inner.reset_counters();

        CircuitBreakerMetrics::set_state(&self.name, next);
        tracing::info!(
            breaker = %self.name,
            from = previous.as_str(),
            to = next.as_str(),
            "Circuit breaker state changed"
        );
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            breaker: self.name.clone(),
        }
    }

    /// Get the current state (no transition is evaluated)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            success_count: inner.successes,
            trial_requests: inner.requests,
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub trial_requests: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
}

#[async_trait]
impl HealthCheckable for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_health(&self) -> DependencyHealth {
        match self.state() {
            CircuitState::Closed => DependencyHealth::healthy(),
            CircuitState::HalfOpen => DependencyHealth::degraded("circuit half-open"),
            CircuitState::Open => DependencyHealth::unhealthy("circuit open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::{Barrier, Semaphore};
    use tokio::task::JoinSet;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Open,
        Failed,
    }

    impl From<CircuitOpenError> for TestError {
        fn from(_: CircuitOpenError) -> Self {
            TestError::Open
        }
    }

    fn breaker(max_requests: u32, failure_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig {
                max_requests,
                failure_threshold,
                interval: Duration::from_secs(60),
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), TestError> {
        cb.call(|| async { Err::<(), _>(TestError::Failed) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), TestError> {
        cb.call(|| async { Ok::<_, TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_closed_admits_calls() {
        let cb = breaker(3, 5, 30_000);
        for _ in 0..3 {
            assert_eq!(succeed(&cb).await, Ok(()));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().success_count, 3);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let cb = breaker(3, 3, 30_000);
        for _ in 0..3 {
            assert_eq!(fail(&cb).await, Err(TestError::Failed));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), TestError> = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(TestError::Open));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_admits_trial() {
        let cb = breaker(3, 1, 50);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_limits_trial_calls() {
        let cb = breaker(2, 1, 50);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Two trial calls admitted while both are still in flight
        cb.before_call().unwrap();
        cb.before_call().unwrap();
        assert!(cb.before_call().is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_closes_after_max_requests_successes() {
        let cb = breaker(2, 1, 50);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(3, 1, 50);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(fail(&cb).await, Err(TestError::Failed));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(succeed(&cb).await, Err(TestError::Open));
    }

    #[tokio::test]
    async fn test_stale_window_forgives_failures() {
        let cb = CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig {
                max_requests: 1,
                failure_threshold: 3,
                interval: Duration::from_millis(30),
                timeout: Duration::from_secs(30),
            },
        );
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Counters were reset by the stale window, so this is failure #1
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test]
    async fn test_opens_after_first_window_has_elapsed() {
        let cb = CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig {
                max_requests: 1,
                failure_threshold: 3,
                interval: Duration::from_millis(30),
                timeout: Duration::from_secs(30),
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_are_not_serialized() {
        let cb = Arc::new(breaker(3, 100, 30_000));
        let barrier = Arc::new(Barrier::new(8));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let cb = cb.clone();
            let barrier = barrier.clone();
            tasks.spawn(async move {
                cb.call(|| async move {
                    // Only completes once all eight operations are in flight together
                    barrier.wait().await;
                    Ok::<_, TestError>(())
                })
                .await
            });
        }

        let results = tokio::time::timeout(Duration::from_secs(5), async {
            let mut results = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                results.push(joined.unwrap());
            }
            results
        })
        .await
        .expect("operations did not overlap");

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(cb.stats().success_count, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_half_open_admits_max_requests_of_concurrent_trials() {
        let cb = Arc::new(breaker(2, 1, 50));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let gate = Arc::new(Semaphore::new(0));
        let admitted = Arc::new(AtomicU32::new(0));
        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let cb = cb.clone();
            let gate = gate.clone();
            let admitted = admitted.clone();
            tasks.spawn(async move {
                cb.call(|| async move {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await;
                    Ok::<_, TestError>(())
                })
                .await
            });
        }

        // Rejected trials return without touching the gate
        let mut rejected = 0;
        while rejected < 8 {
            let joined = tokio::time::timeout(Duration::from_secs(5), tasks.join_next())
                .await
                .expect("rejected trial calls must not block");
            match joined {
                Some(Ok(Err(TestError::Open))) => rejected += 1,
                other => panic!("unexpected completion: {:?}", other),
            }
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        gate.add_permits(10);
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap(), Ok(()));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let cb = breaker(3, 5, 30_000);
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_count, 2);
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_health_reflects_state() {
        let cb = breaker(1, 1, 30_000);
        assert!(cb.check_health().await.is_healthy());
        let _ = fail(&cb).await;
        assert!(!cb.check_health().await.is_healthy());
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
