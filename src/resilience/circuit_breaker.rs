// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-dependency circuit breakers.
//!
//! Protects the model backends from being hammered while down. Each breaker
//! is a small state machine:
//!
//! ```text
//! Closed → Open:      failure_count >= failure_threshold
//! Open → HalfOpen:    recovery_timeout elapsed (checked lazily on call)
//! HalfOpen → Closed:  probe succeeds (failure_count reset)
//! HalfOpen → Open:    probe fails (timeout restarts)
//! ```
//!
//! HalfOpen admits exactly one in-flight probe; concurrent callers are
//! rejected until the probe settles. State is fully observable via
//! [`CircuitBreaker::snapshot`] for the health monitor and metrics surface.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GateError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

impl CircuitState {
    /// Numeric encoding for the state gauge (0 = closed, 1 = half_open, 2 = open)
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures before tripping
    pub failure_threshold: u32,
    /// How long to stay OPEN before allowing a half-open probe
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Mutable breaker state, guarded by one small mutex.
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    entered_at: Instant,
    probe_in_flight: bool,
}

/// Outcome of the admission check, decided under the state lock.
enum Admit {
    /// Proceed normally (CLOSED)
    Normal,
    /// Proceed as the single half-open probe
    Probe,
    /// Fail fast without invoking the operation
    Reject { retry_after: Duration },
}

/// A named circuit breaker with observable state and call counters.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    // Counters for the metrics surface
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Point-in-time view of a breaker, for health and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Seconds spent in the current state
    pub time_in_state_secs: f64,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                entered_at: Instant::now(),
                probe_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute an operation through the breaker.
    ///
    /// If the breaker is OPEN (and the recovery timeout has not elapsed),
    /// returns [`GateError::CircuitOpen`] without invoking `f`. Every
    /// backend failure — retried or not by the outer policy — counts
    /// toward the threshold; local errors like `ServiceBusy` do not.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let admit = self.admit();
        let is_probe = match admit {
            Admit::Reject { retry_after } => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                return Err(GateError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                });
            }
            Admit::Probe => true,
            Admit::Normal => false,
        };

        let result = f().await;

        match &result {
            Ok(_) => self.on_success(is_probe),
            Err(err) if err.counts_toward_breaker() => self.on_failure(is_probe),
            Err(_) => {
                // Local failure (backpressure etc): settle the probe slot
                // without recording a dependency failure.
                if is_probe {
                    self.release_probe();
                }
            }
        }

        result
    }

    /// Decide admission under the state lock, transitioning Open → HalfOpen
    /// when the recovery timeout has elapsed.
    fn admit(&self) -> Admit {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admit::Normal,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    info!(circuit = %self.name, "Circuit entering half-open, probing");
                    Admit::Probe
                } else {
                    Admit::Reject {
                        retry_after: self.config.recovery_timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // Exactly one probe at a time
                    Admit::Reject {
                        retry_after: self.config.recovery_timeout,
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admit::Probe
                }
            }
        }
    }

    fn on_success(&self, was_probe: bool) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "success");

        let mut inner = self.inner.lock();
        if was_probe {
            inner.probe_in_flight = false;
            self.transition(&mut inner, CircuitState::Closed);
            inner.failure_count = 0;
            inner.opened_at = None;
            info!(circuit = %self.name, "Circuit closed after successful probe");
        } else if inner.failure_count > 0 {
            // Consecutive-failure semantics: success resets the streak
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, was_probe: bool) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        if was_probe {
            inner.probe_in_flight = false;
            self.transition(&mut inner, CircuitState::Open);
            inner.opened_at = Some(Instant::now());
            warn!(circuit = %self.name, "Circuit re-opened after failed probe");
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        inner.failure_count += 1;
        debug!(circuit = %self.name, failures = inner.failure_count, "Circuit recorded failure");
        if inner.failure_count >= self.config.failure_threshold {
            self.transition(&mut inner, CircuitState::Open);
            inner.opened_at = Some(Instant::now());
            warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "Circuit OPENED"
            );
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        inner.state = to;
        inner.entered_at = Instant::now();
        crate::metrics::set_circuit_state(&self.name, to.as_gauge());
    }

    /// Manually reset to CLOSED (operator action).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!(circuit = %self.name, "Circuit manually reset");
    }

    /// Observable snapshot for health checks and the metrics surface.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            time_in_state_secs: inner.entered_at.elapsed().as_secs_f64(),
            calls_total: self.calls_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// One breaker per dependency name, living for the process lifetime.
///
/// Built once at startup and shared by reference — there is no module-level
/// global registry.
pub struct BreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for a dependency, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshots of every registered breaker.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snaps: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    /// Reset every breaker to CLOSED (operator action).
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::atomic::AtomicUsize;

    fn backend_err() -> GateError {
        GateError::Backend(BackendError::Transient("boom".into()))
    }

    async fn fail(cb: &CircuitBreaker) {
        let _: Result<i32, GateError> = cb.execute(|| async { Err(backend_err()) }).await;
    }

    #[tokio::test]
    async fn test_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, GateError> = cb.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        });

        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Next call rejected without invoking the operation
        let invoked = AtomicUsize::new(0);
        let result: Result<i32, GateError> = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert!(matches!(result, Err(GateError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        });

        fail(&cb).await;
        fail(&cb).await;
        let _: Result<i32, GateError> = cb.execute(|| async { Ok(1) }).await;
        fail(&cb).await;
        fail(&cb).await;

        // 2 failures, success, 2 failures: never 3 consecutive
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
        });

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Probe allowed and succeeds
        let result: Result<i32, GateError> = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
        });

        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        fail(&cb).await; // probe fails
        assert_eq!(cb.state(), CircuitState::Open);

        // Timeout restarted: immediate call rejected
        let result: Result<i32, GateError> = cb.execute(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(GateError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_probe() {
        let cb = Arc::new(CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        }));

        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First caller takes the probe slot and holds it
        let cb1 = cb.clone();
        let probe = tokio::spawn(async move {
            cb1.execute(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, GateError>(1)
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Concurrent caller is rejected while the probe is in flight
        let result: Result<i32, GateError> = cb.execute(|| async { Ok(2) }).await;
        assert!(matches!(result, Err(GateError::CircuitOpen { .. })));

        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_local_errors_do_not_count() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        });

        for _ in 0..5 {
            let _: Result<i32, GateError> =
                cb.execute(|| async { Err(GateError::ServiceBusy) }).await;
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        });

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        let result: Result<i32, GateError> = cb.execute(|| async { Ok(1) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_registry_one_breaker_per_name() {
        let registry = BreakerRegistry::new(CircuitConfig::default());

        let a = registry.get("translation");
        let b = registry.get("translation");
        let c = registry.get("transcription");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "transcription");
        assert_eq!(snaps[1].name, "translation");
    }
}
