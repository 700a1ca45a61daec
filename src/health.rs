// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health aggregation.
//!
//! The monitor runs independently timeboxed sub-checks and folds them into
//! one aggregate status. A hanging check can never stall the report: each
//! check races a fixed timeout and a timeout counts as a failure. The
//! liveness probe is separate and touches no dependencies.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::backend::ModelBackend;
use crate::cache::ResultCache;
use crate::orchestrator::WorkerPool;
use crate::resilience::circuit_breaker::{BreakerRegistry, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Numeric encoding for the health gauge (0 = healthy, 1 = degraded, 2 = unhealthy)
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

/// What one sub-check reported.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckOutcome {
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
}

/// One entry in the readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub critical: bool,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// A timeboxed health sub-check.
///
/// `critical` controls aggregation: a failing critical check makes the
/// whole service unhealthy, a failing non-critical one only degrades it.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> CheckOutcome;
}

type CheckFn =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = CheckOutcome> + Send>> + Send + Sync>;

/// Closure adapter for environment-specific checks (CPU, memory, GPU
/// thresholds) whose probing lives outside this crate.
pub struct FnCheck {
    name: String,
    critical: bool,
    f: CheckFn,
}

impl FnCheck {
    pub fn new<F, Fut>(name: impl Into<String>, critical: bool, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CheckOutcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            critical,
            f: Box::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl HealthCheck for FnCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> CheckOutcome {
        (self.f)().await
    }
}

/// Critical check: is the model backend loaded?
pub struct BackendLoadedCheck {
    backend: Arc<dyn ModelBackend>,
}

impl BackendLoadedCheck {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthCheck for BackendLoadedCheck {
    fn name(&self) -> &str {
        "model_backend"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> CheckOutcome {
        if self.backend.is_loaded() {
            CheckOutcome::healthy()
        } else {
            CheckOutcome::unhealthy(format!("backend '{}' not loaded", self.backend.name()))
        }
    }
}

/// Non-critical check: can we reach the cache store? The cache degrades
/// to pass-through when down, so this only ever degrades the aggregate.
pub struct CacheReachableCheck {
    cache: Arc<ResultCache>,
}

impl CacheReachableCheck {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl HealthCheck for CacheReachableCheck {
    fn name(&self) -> &str {
        "result_cache"
    }

    async fn check(&self) -> CheckOutcome {
        if self.cache.is_reachable().await {
            CheckOutcome::healthy()
        } else {
            CheckOutcome::degraded("cache store unreachable, running pass-through")
        }
    }
}

/// Non-critical check: are any circuit breakers open?
pub struct BreakerStateCheck {
    registry: Arc<BreakerRegistry>,
}

impl BreakerStateCheck {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealthCheck for BreakerStateCheck {
    fn name(&self) -> &str {
        "circuit_breakers"
    }

    async fn check(&self) -> CheckOutcome {
        let open: Vec<String> = self
            .registry
            .snapshots()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| format!("{} ({})", s.name, s.state))
            .collect();
        if open.is_empty() {
            CheckOutcome::healthy()
        } else {
            CheckOutcome::degraded(format!("breakers not closed: {}", open.join(", ")))
        }
    }
}

/// Non-critical check: does the worker pool still have headroom? A full
/// pool means new requests are being bounced with ServiceBusy.
pub struct PoolSaturationCheck {
    pool: Arc<WorkerPool>,
}

impl PoolSaturationCheck {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for PoolSaturationCheck {
    fn name(&self) -> &str {
        "worker_pool"
    }

    async fn check(&self) -> CheckOutcome {
        let stats = self.pool.stats();
        let capacity = stats.worker_count + stats.queue_bound;
        if stats.active + stats.queued >= capacity {
            CheckOutcome::degraded(format!(
                "pool saturated: {} active, {} queued (capacity {capacity})",
                stats.active, stats.queued
            ))
        } else {
            CheckOutcome::healthy()
        }
    }
}

/// Fast liveness answer: the process is up and scheduling tasks.
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub alive: bool,
    pub uptime_secs: u64,
}

/// Full readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
}

pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    check_timeout: Duration,
    started_at: Instant,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            check_timeout,
            started_at: Instant::now(),
        }
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheck>) {
        self.checks.push(check);
    }

    #[must_use]
    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.register(check);
        self
    }

    /// Cheap probe with no dependency calls.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        Liveness {
            alive: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Run every registered check concurrently, each against the timeout,
    /// and fold the outcomes into one aggregate status.
    pub async fn readiness(&self) -> HealthReport {
        let mut handles = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let check = check.clone();
            let timeout = self.check_timeout;
            handles.push(tokio::spawn(async move {
                let name = check.name().to_string();
                let critical = check.critical();
                let start = Instant::now();
                let outcome = match tokio::time::timeout(timeout, check.check()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(check = %name, timeout_ms = timeout.as_millis() as u64, "Health check timed out");
                        CheckOutcome::unhealthy(format!("timed out after {timeout:?}"))
                    }
                };
                CheckResult {
                    name,
                    critical,
                    status: outcome.status,
                    detail: outcome.detail,
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!(error = %join_err, "Health check task panicked");
                    results.push(CheckResult {
                        name: "unknown".to_string(),
                        critical: true,
                        status: HealthStatus::Unhealthy,
                        detail: Some("check task panicked".to_string()),
                        duration_ms: 0,
                    });
                }
            }
        }

        let status = Self::aggregate(&results);
        crate::metrics::set_health_status(status.as_gauge());
        HealthReport {
            status,
            checks: results,
        }
    }

    fn aggregate(results: &[CheckResult]) -> HealthStatus {
        let mut degraded = false;
        for result in results {
            match result.status {
                HealthStatus::Unhealthy if result.critical => return HealthStatus::Unhealthy,
                HealthStatus::Unhealthy | HealthStatus::Degraded => degraded = true,
                HealthStatus::Healthy => {}
            }
        }
        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
