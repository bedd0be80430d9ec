//! Dependency health checks.
//!
//! Each dependency wrapper (circuit breaker, queue transport, guard store)
//! implements [`HealthCheckable`]; the [`HealthRegistry`] aggregates them
//! into a single report for the `/health` endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;

/// Health of a single dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DependencyHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Capability implemented by every dependency that can report its health.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Name reported in the aggregated health document
    fn name(&self) -> &str;

    async fn check_health(&self) -> DependencyHealth;
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedHealth {
    pub name: String,
    #[serde(flatten)]
    pub health: DependencyHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "healthy" when every dependency is healthy, "degraded" otherwise
    pub status: &'static str,
    pub dependencies: Vec<NamedHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Collection of health-checkable dependencies.
#[derive(Default, Clone)]
pub struct HealthRegistry {
    checks: Vec<Arc<dyn HealthCheckable>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheckable>) {
        self.checks.push(check);
    }

    /// Run every check concurrently and aggregate the results.
    pub async fn report(&self) -> HealthReport {
        let results = join_all(self.checks.iter().map(|check| async move {
            NamedHealth {
                name: check.name().to_string(),
                health: check.check_health().await,
            }
        }))
        .await;

        let all_healthy = results.iter().all(|r| r.health.is_healthy());

        HealthReport {
            status: if all_healthy { "healthy" } else { "degraded" },
            dependencies: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, DependencyHealth);

    #[async_trait]
    impl HealthCheckable for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn check_health(&self) -> DependencyHealth {
            self.1.clone()
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let report = HealthRegistry::new().report().await;
        assert!(report.is_healthy());
        assert!(report.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_any_unhealthy_dependency_degrades() {
        let mut registry = HealthRegistry::new();
        registry.register(Arc::new(Fixed("broker", DependencyHealth::healthy())));
        registry.register(Arc::new(Fixed(
            "redis",
            DependencyHealth::unhealthy("connection refused"),
        )));

        let report = registry.report().await;
        assert_eq!(report.status, "degraded");
        assert_eq!(report.dependencies.len(), 2);
        assert_eq!(report.dependencies[1].name, "redis");
        assert_eq!(report.dependencies[1].health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_report_serializes_flat() {
        let mut registry = HealthRegistry::new();
        registry.register(Arc::new(Fixed("breaker", DependencyHealth::degraded("half-open"))));

        let json = serde_json::to_value(registry.report().await).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["dependencies"][0]["name"], "breaker");
        assert_eq!(json["dependencies"][0]["status"], "degraded");
        assert_eq!(json["dependencies"][0]["detail"], "half-open");
    }
}
