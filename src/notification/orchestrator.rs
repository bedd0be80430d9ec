//! Per-job delivery pipeline.
//!
//! Rate limit, validate, dedupe, render, dispatch, report. The first
//! terminal condition short-circuits the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::guard::{DeliveryGuard, RateLimitDecision};
use crate::metrics::DeliveryMetrics;
use crate::queue::{MessageHandler, StatusPublisher};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::template::{self, TemplateError, TemplateSource};

use super::gateway::PushGateway;
use super::types::{
    DeliveryOutcome, NotificationJob, NotificationStatus, PushContent, StatusReport,
};

/// Largest token list sent in one multicast request
pub const MULTICAST_BATCH_LIMIT: usize = 500;

/// Statistics for the delivery orchestrator
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub partially_delivered: AtomicU64,
    pub failed: AtomicU64,
    pub duplicates: AtomicU64,
    pub rate_limited: AtomicU64,
}

impl OrchestratorStats {
    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            partially_delivered: self.partially_delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    fn record(&self, status: NotificationStatus) {
        let counter = match status {
            NotificationStatus::Delivered => &self.delivered,
            NotificationStatus::PartiallyDelivered => &self.partially_delivered,
            NotificationStatus::Failed | NotificationStatus::Pending => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of orchestrator statistics
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub partially_delivered: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
}

/// Latest outcome per device token across every attempt of one job.
///
/// Devices with a recorded success are never sent to again.
struct OutcomeLedger {
    entries: Mutex<HashMap<String, DeliveryOutcome>>,
    correlation_id: Option<String>,
}

impl OutcomeLedger {
    fn new(correlation_id: Option<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            correlation_id,
        }
    }

    fn pending(&self, tokens: &[String]) -> Vec<String> {
        let entries = self.entries.lock();
        tokens
            .iter()
            .filter(|t| !entries.get(t.as_str()).map(|o| o.success).unwrap_or(false))
            .cloned()
            .collect()
    }

    fn record(&self, outcomes: Vec<DeliveryOutcome>) {
        let succeeded = outcomes.iter().filter(|o| o.success).count() as u64;
        DeliveryMetrics::record_devices(succeeded, outcomes.len() as u64 - succeeded);

        let mut entries = self.entries.lock();
        for mut outcome in outcomes {
            outcome.correlation_id = self.correlation_id.clone();
            entries.insert(outcome.device_token.clone(), outcome);
        }
    }

    /// Outcomes recorded for `tokens`, skipping devices that were never reached
    fn outcomes_for(&self, tokens: &[String]) -> Vec<DeliveryOutcome> {
        let entries = self.entries.lock();
        tokens
            .iter()
            .filter_map(|t| entries.get(t.as_str()).cloned())
            .collect()
    }

    /// One outcome per token. Devices never reached are failed with `error`.
    fn results(&self, tokens: &[String], error: Option<&DeliveryError>) -> Vec<DeliveryOutcome> {
        let entries = self.entries.lock();
        let unreached = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "not attempted".to_string());
        tokens
            .iter()
            .map(|t| {
                entries.get(t.as_str()).cloned().unwrap_or_else(|| {
                    let mut outcome = DeliveryOutcome::failed(t.as_str(), unreached.clone());
                    outcome.correlation_id = self.correlation_id.clone();
                    outcome
                })
            })
            .collect()
    }
}

/// Runs the delivery pipeline for each job handed over by the queue transport.
pub struct DeliveryOrchestrator {
    guard: Arc<DeliveryGuard>,
    templates: Arc<dyn TemplateSource>,
    gateway: Arc<dyn PushGateway>,
    breaker: Arc<CircuitBreaker>,
    status: Arc<dyn StatusPublisher>,
    retry: RetryPolicy,
    stats: OrchestratorStats,
}

impl DeliveryOrchestrator {
    pub fn new(
        guard: Arc<DeliveryGuard>,
        templates: Arc<dyn TemplateSource>,
        gateway: Arc<dyn PushGateway>,
        breaker: Arc<CircuitBreaker>,
        status: Arc<dyn StatusPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            guard,
            templates,
            gateway,
            breaker,
            status,
            retry,
            stats: OrchestratorStats::default(),
        }
    }

    pub fn stats(&self) -> OrchestratorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Process one job to a terminal outcome.
    ///
    /// `Ok` covers delivered, partially delivered and suppressed duplicates.
    /// Every `Err` has already been reported on the status queue.
    #[tracing::instrument(
        name = "process_notification",
        skip(self, job, cancel),
        fields(
            notification_id = %job.id,
            user_id = %job.user_id,
            correlation_id = job.correlation_id.as_deref().unwrap_or(""),
            attempt = job.attempt_count
        )
    )]
    pub async fn process(
        &self,
        job: &mut NotificationJob,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let started = Instant::now();
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if let RateLimitDecision::Exceeded { count, limit } =
            self.guard.check_rate_limit(&job.user_id).await
        {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            DeliveryMetrics::record_rate_limited();
            tracing::warn!(count = count, limit = limit, "Rate limit exceeded");

            let err = DeliveryError::RateLimited {
                user_id: job.user_id.clone(),
                limit,
            };
            self.fail(job, "Rate limit exceeded".to_string(), &err, started)
                .await;
            return Err(err);
        }

        if let Err(e) = job.validate() {
            tracing::warn!(error = %e, "Notification failed validation");
            let message = format!("Validation failed: {}", e);
            let err = DeliveryError::Validation(e);
            self.fail(job, message, &err, started).await;
            return Err(err);
        }

        if self.guard.is_duplicate(&job.id).await {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            DeliveryMetrics::record_duplicate();
            tracing::info!("Duplicate notification suppressed");
            return Ok(());
        }

        let content = match self.prepare(job).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prepare notification");
                let message = format!("Failed to prepare notification: {}", e);
                let err = DeliveryError::Template(e);
                self.fail(job, message, &err, started).await;
                return Err(err);
            }
        };

        let tokens = job.valid_tokens();
        let ledger = OutcomeLedger::new(job.correlation_id.clone());
        let dispatch = self.dispatch(job, &tokens, &content, &ledger, cancel).await;

        let results = ledger.results(&tokens, dispatch.as_ref().err());
        let sent = results.iter().filter(|o| o.success).count();
        let failed = results.len() - sent;
        let status = NotificationStatus::from_counts(sent, failed);

        let message = match status {
            NotificationStatus::Delivered => "Notification delivered successfully".to_string(),
            NotificationStatus::PartiallyDelivered => {
                format!("Partially delivered: {} succeeded, {} failed", sent, failed)
            }
            _ => "All notifications failed to deliver".to_string(),
        };

        let error = dispatch.as_ref().err().map(|e| e.to_string());
        let report = status_report(job, status, message, sent, failed, results, error);
        self.finish(job, report, started).await;

        match dispatch {
            Err(err) if status == NotificationStatus::Failed => {
                tracing::error!(error = %err, "Notification delivery failed");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    sent_count = sent,
                    failed_count = failed,
                    "Notification partially delivered"
                );
                Ok(())
            }
            Ok(()) => {
                tracing::info!(sent_count = sent, failed_count = failed, "Notification dispatched");
                Ok(())
            }
        }
    }

    async fn prepare(&self, job: &NotificationJob) -> Result<PushContent, TemplateError> {
        match job.template() {
            Some(code) => {
                let template = self.templates.fetch_push_template(code).await?;
                Ok(template::render(&template, job))
            }
            None => Ok(PushContent::from_job(job)),
        }
    }

    /// Send to every device in `tokens` under retry and the circuit breaker.
    ///
    /// An attempt fails when every device it targeted failed; partial
    /// success ends the retries. `job.attempt_count` is advanced by the
    /// attempts spent here.
    async fn dispatch(
        &self,
        job: &mut NotificationJob,
        tokens: &[String],
        content: &PushContent,
        ledger: &OutcomeLedger,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let spent = AtomicU32::new(job.attempt_count);
        let spent_ref = &spent;

        let result = self
            .retry
            .retry(cancel, job.attempt_count, move |attempt| {
                spent_ref.store(attempt + 1, Ordering::Relaxed);
                let pending = ledger.pending(tokens);

                async move {
                    tracing::debug!(attempt = attempt, devices = pending.len(), "Dispatch attempt");

                    self.breaker
                        .call(|| self.send_batches(&pending, content, ledger))
                        .await?;

                    let outcomes = ledger.outcomes_for(&pending);
                    if outcomes.iter().any(|o| o.success) {
                        return Ok(());
                    }
                    Err(DeliveryError::AllDevicesFailed {
                        failed: outcomes.len(),
                        last_error: outcomes.iter().rev().find_map(|o| o.error.clone()),
                    })
                }
            })
            .await;

        job.attempt_count = spent.load(Ordering::Relaxed);
        result
    }

    /// One `send` for a single device, otherwise multicast in batches.
    ///
    /// Outcomes of completed batches stay in the ledger when a later batch
    /// fails, so a retry only targets the devices still pending.
    async fn send_batches(
        &self,
        pending: &[String],
        content: &PushContent,
        ledger: &OutcomeLedger,
    ) -> Result<(), DeliveryError> {
        if let [token] = pending {
            let outcome = self.gateway.send(token, content).await?;
            ledger.record(vec![outcome]);
            return Ok(());
        }

        for batch in pending.chunks(MULTICAST_BATCH_LIMIT) {
            let outcomes = self.gateway.send_many(batch, content).await?;
            ledger.record(outcomes);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &NotificationJob,
        message: String,
        err: &DeliveryError,
        started: Instant,
    ) {
        let report = status_report(
            job,
            NotificationStatus::Failed,
            message,
            0,
            0,
            Vec::new(),
            Some(err.to_string()),
        );
        self.finish(job, report, started).await;
    }

    /// Emit the status report, then write the processed marker.
    async fn finish(&self, job: &NotificationJob, report: StatusReport, started: Instant) {
        let status = report.status;
        self.stats.record(status);
        DeliveryMetrics::record_outcome(status, started.elapsed());

        if let Err(e) = self.status.publish_status(&report).await {
            tracing::error!(
                status = status.as_str(),
                error = %e,
                "Failed to publish status report"
            );
        }

        if !job.id.trim().is_empty() {
            self.guard.mark_processed(&job.id).await;
        }
    }
}

fn status_report(
    job: &NotificationJob,
    status: NotificationStatus,
    message: String,
    sent_count: usize,
    failed_count: usize,
    results: Vec<DeliveryOutcome>,
    error: Option<String>,
) -> StatusReport {
    StatusReport {
        notification_id: job.id.clone(),
        request_id: job.request_id.clone(),
        user_id: job.user_id.clone(),
        status,
        message,
        sent_count,
        failed_count,
        results,
        error,
        timestamp: Utc::now(),
        correlation_id: job.correlation_id.clone(),
    }
}

#[async_trait]
impl MessageHandler for DeliveryOrchestrator {
    async fn handle(
        &self,
        job: &mut NotificationJob,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.process(job, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::guard::{idempotency_key, GuardStore, MemoryGuardStore};
    use crate::notification::GatewayError;
    use crate::queue::QueueError;
    use crate::resilience::CircuitBreakerConfig;
    use crate::template::PushTemplate;
    use std::time::Duration;

    /// Rejects the listed tokens and fails the listed calls at the gateway level
    #[derive(Default)]
    struct FakeGateway {
        reject: Vec<String>,
        /// 0-based call numbers answered with a gateway error
        fail_calls: Vec<usize>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeGateway {
        fn begin(&self, tokens: Vec<String>) -> Result<(), GatewayError> {
            let mut calls = self.calls.lock();
            let n = calls.len();
            calls.push(tokens);
            if self.fail_calls.contains(&n) {
                return Err(unavailable());
            }
            Ok(())
        }

        fn outcome(&self, token: &str) -> DeliveryOutcome {
            if self.reject.iter().any(|t| t == token) {
                DeliveryOutcome::failed(token, "unregistered")
            } else {
                DeliveryOutcome::delivered(token, format!("msg-{}", token))
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PushGateway for FakeGateway {
        async fn send(
            &self,
            device_token: &str,
            _content: &PushContent,
        ) -> Result<DeliveryOutcome, GatewayError> {
            self.begin(vec![device_token.to_string()])?;
            Ok(self.outcome(device_token))
        }

        async fn send_many(
            &self,
            device_tokens: &[String],
            _content: &PushContent,
        ) -> Result<Vec<DeliveryOutcome>, GatewayError> {
            self.begin(device_tokens.to_vec())?;
            Ok(device_tokens.iter().map(|t| self.outcome(t)).collect())
        }
    }

    #[derive(Default)]
    struct Templates;

    #[async_trait]
    impl TemplateSource for Templates {
        async fn fetch_push_template(&self, code: &str) -> Result<PushTemplate, TemplateError> {
            if code != "welcome" {
                return Err(TemplateError::NotFound(code.to_string()));
            }
            Ok(PushTemplate {
                code: code.to_string(),
                name: "Welcome".into(),
                title: "Hi {{name}}".into(),
                body: "Welcome aboard".into(),
                image_url: None,
                link: None,
                data: Default::default(),
            })
        }
    }

    #[derive(Default)]
    struct Reports(Mutex<Vec<StatusReport>>);

    #[async_trait]
    impl StatusPublisher for Reports {
        async fn publish_status(&self, report: &StatusReport) -> Result<(), QueueError> {
            self.0.lock().push(report.clone());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: DeliveryOrchestrator,
        gateway: Arc<FakeGateway>,
        reports: Arc<Reports>,
        store: Arc<MemoryGuardStore>,
    }

    fn harness(gateway: FakeGateway, requests: u64) -> Harness {
        let gateway = Arc::new(gateway);
        let reports = Arc::new(Reports::default());
        let store = Arc::new(MemoryGuardStore::new());
        let guard = Arc::new(DeliveryGuard::new(
            store.clone(),
            &RateLimitConfig {
                requests,
                window_secs: 60,
            },
        ));
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        };
        let orchestrator = DeliveryOrchestrator::new(
            guard,
            Arc::new(Templates),
            gateway.clone(),
            Arc::new(CircuitBreaker::with_config(
                "push_gateway",
                CircuitBreakerConfig::default(),
            )),
            reports.clone(),
            retry,
        );
        Harness {
            orchestrator,
            gateway,
            reports,
            store,
        }
    }

    fn job(tokens: &[&str]) -> NotificationJob {
        NotificationJob::new("n1", "u1", tokens.iter().map(|t| t.to_string()).collect())
            .with_content("Title", "Body")
            .with_correlation_id("corr-1")
    }

    fn unavailable() -> GatewayError {
        GatewayError::Status {
            status: 503,
            body: "unavailable".into(),
        }
    }

    #[tokio::test]
    async fn test_partial_delivery_is_reported_and_not_retried() {
        let h = harness(
            FakeGateway {
                reject: vec!["b".into()],
                ..Default::default()
            },
            100,
        );
        let mut job = job(&["a", "b", "c"]);

        h.orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        let reports = h.reports.0.lock().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, NotificationStatus::PartiallyDelivered);
        assert_eq!(reports[0].sent_count, 2);
        assert_eq!(reports[0].failed_count, 1);
        assert_eq!(reports[0].message, "Partially delivered: 2 succeeded, 1 failed");
        assert!(reports[0]
            .results
            .iter()
            .all(|o| o.correlation_id.as_deref() == Some("corr-1")));
        assert_eq!(h.gateway.calls().len(), 1);
        assert_eq!(job.attempt_count, 1);
        assert!(h.store.exists(&idempotency_key("n1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_token_uses_send() {
        let h = harness(FakeGateway::default(), 100);
        let mut job = job(&["  only  "]);

        h.orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.gateway.calls(), vec![vec!["only".to_string()]]);
        let reports = h.reports.0.lock().clone();
        assert_eq!(reports[0].status, NotificationStatus::Delivered);
        assert_eq!(reports[0].message, "Notification delivered successfully");
    }

    #[tokio::test]
    async fn test_all_devices_failed_is_retried_then_fails() {
        let h = harness(
            FakeGateway {
                reject: vec!["a".into(), "b".into()],
                ..Default::default()
            },
            100,
        );
        let mut job = job(&["a", "b"]);

        let err = h
            .orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "all_devices_failed");
        assert_eq!(h.gateway.calls().len(), 3);
        assert_eq!(job.attempt_count, 3);

        let reports = h.reports.0.lock().clone();
        assert_eq!(reports[0].status, NotificationStatus::Failed);
        assert_eq!(reports[0].message, "All notifications failed to deliver");
        assert_eq!(reports[0].failed_count, 2);
        // Per-device rejections leave the circuit closed
        assert_eq!(
            h.orchestrator.breaker().state(),
            crate::resilience::CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_gateway_error_is_retried() {
        let h = harness(
            FakeGateway {
                fail_calls: vec![0],
                ..Default::default()
            },
            100,
        );
        let mut job = job(&["a", "b"]);

        h.orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.gateway.calls().len(), 2);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(h.orchestrator.breaker().stats().failure_count, 1);
        assert_eq!(
            h.reports.0.lock()[0].status,
            NotificationStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_retry_skips_devices_already_delivered() {
        // First batch goes through, the second hits a gateway error
        let h = harness(
            FakeGateway {
                fail_calls: vec![1],
                ..Default::default()
            },
            100,
        );
        let tokens: Vec<String> = (0..MULTICAST_BATCH_LIMIT + 2)
            .map(|i| format!("t{}", i))
            .collect();
        let mut job = NotificationJob::new("n1", "u1", tokens).with_content("T", "B");

        h.orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].len(), MULTICAST_BATCH_LIMIT);
        assert_eq!(calls[2], vec!["t500".to_string(), "t501".to_string()]);

        let report = h.reports.0.lock()[0].clone();
        assert_eq!(report.status, NotificationStatus::Delivered);
        assert_eq!(report.sent_count, MULTICAST_BATCH_LIMIT + 2);
        assert_eq!(job.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_already_spent() {
        let h = harness(FakeGateway::default(), 100);
        let mut job = job(&["a"]);
        job.attempt_count = 3;

        let err = h
            .orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "max_retries_exceeded");
        assert!(h.gateway.calls().is_empty());
        let reports = h.reports.0.lock().clone();
        assert_eq!(reports[0].status, NotificationStatus::Failed);
        assert_eq!(reports[0].results[0].device_token, "a");
        assert!(!reports[0].results[0].success);
    }

    #[tokio::test]
    async fn test_duplicate_is_silent() {
        let h = harness(FakeGateway::default(), 100);
        let cancel = CancellationToken::new();

        h.orchestrator.process(&mut job(&["a"]), &cancel).await.unwrap();
        h.orchestrator.process(&mut job(&["a"]), &cancel).await.unwrap();

        assert_eq!(h.gateway.calls().len(), 1);
        assert_eq!(h.reports.0.lock().len(), 1);
        assert_eq!(h.orchestrator.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_job_never_dispatches() {
        let h = harness(FakeGateway::default(), 1);
        let cancel = CancellationToken::new();

        h.orchestrator.process(&mut job(&["a"]), &cancel).await.unwrap();
        let mut second = job(&["a"]);
        second.id = "n2".into();
        let err = h.orchestrator.process(&mut second, &cancel).await.unwrap_err();

        assert_eq!(err.reason(), "rate_limit_exceeded");
        assert_eq!(h.gateway.calls().len(), 1);
        let reports = h.reports.0.lock().clone();
        assert_eq!(reports[1].status, NotificationStatus::Failed);
        assert_eq!(reports[1].message, "Rate limit exceeded");
        assert_eq!(h.orchestrator.stats().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_reports_and_skips_marker_without_id() {
        let h = harness(FakeGateway::default(), 100);
        let mut job = job(&[]);

        let err = h
            .orchestrator
            .process(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "validation_failed");
        assert_eq!(
            h.reports.0.lock()[0].message,
            "Validation failed: no device tokens provided"
        );
        assert!(h.store.exists(&idempotency_key("n1")).await.unwrap());

        let mut anonymous = NotificationJob::new("", "u1", vec!["a".into()]);
        assert!(h
            .orchestrator
            .process(&mut anonymous, &CancellationToken::new())
            .await
            .is_err());
        assert!(!h.store.exists(&idempotency_key("")).await.unwrap());
    }

    #[tokio::test]
    async fn test_template_is_rendered_or_fails() {
        let h = harness(FakeGateway::default(), 100);
        let mut vars = crate::notification::DataMap::new();
        vars.insert("name".into(), "Ada".into());

        let mut ok = NotificationJob::new("n1", "u1", vec!["a".into()]).with_template("welcome", vars);
        h.orchestrator
            .process(&mut ok, &CancellationToken::new())
            .await
            .unwrap();

        let mut missing =
            NotificationJob::new("n2", "u1", vec!["a".into()]).with_template("gone", Default::default());
        let err = h
            .orchestrator
            .process(&mut missing, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "template_error");

        let reports = h.reports.0.lock().clone();
        assert_eq!(
            reports[1].message,
            "Failed to prepare notification: Template not found: gone"
        );
        assert_eq!(h.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_fails_job() {
        let h = harness(
            FakeGateway {
                fail_calls: vec![0],
                ..Default::default()
            },
            100,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .orchestrator
            .process(&mut job(&["a", "b"]), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "cancelled");
        assert_eq!(h.reports.0.lock()[0].status, NotificationStatus::Failed);
    }
}
