//! Health check service backing the control endpoints
//!
//! Checks are named and tagged; the readiness endpoint reports only the
//! `infrastructure` subset, liveness reports nothing but the process
//! itself.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::CounterStore;
use crate::services::registry::ServiceRegistry;
use crate::services::router::{RouteResolver, ServiceHealth};

/// Overall and per-check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One named check result
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub description: String,
    pub duration_ms: f64,
    /// `infrastructure` checks gate readiness
    pub tags: Vec<String>,
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
}

/// Runs the configured checks on demand
pub struct HealthService {
    store: Arc<dyn CounterStore>,
    registry: Arc<ServiceRegistry>,
    resolver: Arc<RouteResolver>,
}

impl HealthService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        registry: Arc<ServiceRegistry>,
        resolver: Arc<RouteResolver>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
        }
    }

    /// Full report: counter store plus every registered backend service
    pub async fn check_all(&self) -> HealthReport {
        let mut checks = vec![self.check_store().await];
        for service in self.registry.service_names() {
            checks.push(self.check_backend(&service).await);
        }
        HealthReport {
            status: overall(&checks),
            checks,
        }
    }

    /// Readiness: only checks tagged `infrastructure`
    pub async fn check_ready(&self) -> HealthReport {
        let checks = vec![self.check_store().await];
        HealthReport {
            status: overall(&checks),
            checks,
        }
    }

    async fn check_store(&self) -> CheckResult {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => {
                debug!("Counter store health check passed");
                CheckResult {
                    name: "counter-store".to_string(),
                    status: HealthStatus::Healthy,
                    description: "counter store reachable".to_string(),
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    tags: vec!["infrastructure".to_string()],
                }
            }
            Err(e) => {
                warn!(error = %e, "Counter store health check failed");
                CheckResult {
                    name: "counter-store".to_string(),
                    status: HealthStatus::Unhealthy,
                    description: e.to_string(),
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    tags: vec!["infrastructure".to_string()],
                }
            }
        }
    }

    async fn check_backend(&self, service: &str) -> CheckResult {
        let start = Instant::now();
        let status = match self.resolver.service_health(service).await {
            ServiceHealth::Healthy => HealthStatus::Healthy,
            ServiceHealth::Degraded | ServiceHealth::Unknown => HealthStatus::Degraded,
            ServiceHealth::Unhealthy => HealthStatus::Unhealthy,
        };
        CheckResult {
            name: format!("backend:{}", service),
            status,
            description: format!("health probe of '{}'", service),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            tags: vec!["backend".to_string()],
        }
    }
}

fn overall(checks: &[CheckResult]) -> HealthStatus {
    if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use reqwest::Client;

    #[tokio::test]
    async fn test_healthy_store_reports_healthy() {
        let store = Arc::new(MemoryCounterStore::new());
        let registry = Arc::new(ServiceRegistry::new());
        let resolver = Arc::new(RouteResolver::new(Arc::clone(&registry), Client::new()));
        let service = HealthService::new(store, registry, resolver);

        let report = service.check_all().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "counter-store");

        let ready = service.check_ready().await;
        assert!(ready
            .checks
            .iter()
            .all(|c| c.tags.contains(&"infrastructure".to_string())));
    }
}
