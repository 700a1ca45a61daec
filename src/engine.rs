// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The assembled gate: admission, caching, resilience, and the worker
//! pool composed into the two public operations.
//!
//! Per-request flow:
//!
//! ```text
//! admit (rate + quota reserve)
//!   -> cache lookup
//!   -> miss: retry( breaker( pool( timeout( backend call ))))
//!   -> cache store
//! -> commit on success, rollback on failure
//! ```
//!
//! Retry sits outermost so every attempt is a distinct breaker-counted
//! call, and a breaker-open failure short-circuits without touching the
//! retry budget. All components are built once here and shared by
//! reference; there is no module-level global state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::cache::{
    ArtifactKind, CacheStats, CacheStore, CachedArtifact, Fingerprint, MemoryStore, RedisStore,
    ResultCache,
};
use crate::config::EngineConfig;
use crate::error::{BackendError, GateError};
use crate::health::{
    BackendLoadedCheck, BreakerStateCheck, CacheReachableCheck, HealthCheck, HealthMonitor,
    HealthReport, Liveness, PoolSaturationCheck,
};
use crate::limits::{QuotaLedger, RateDecision, RequestGate, ResourceEstimate, UsageSummary};
use crate::metrics::LatencyTimer;
use crate::orchestrator::{PoolStats, WorkerPool};
use crate::principal::{Principal, RequestContext};
use crate::resilience::circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitConfig};
use crate::resilience::retry::{retry, RetryPolicy};

const TRANSLATION_CIRCUIT: &str = "translation";
const TRANSCRIPTION_CIRCUIT: &str = "transcription";

/// A successful operation result with response metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GateResponse {
    pub request_id: Uuid,
    pub kind: ArtifactKind,
    pub output: String,
    pub cache_hit: bool,
    /// Rate-limit standing for response headers. `None` until settlement.
    pub rate: Option<RateDecision>,
}

/// One item of a translation batch.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// Point-in-time operational counters for the metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub cache: CacheStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub pool: PoolStats,
}

/// The resilience control plane for one process.
///
/// Construct once at startup with [`InferenceGate::new`] and share behind
/// an `Arc` in request handlers.
pub struct InferenceGate {
    gate: RequestGate,
    ledger: Arc<QuotaLedger>,
    cache: Arc<ResultCache>,
    breakers: Arc<BreakerRegistry>,
    retry_policy: RetryPolicy,
    pool: Arc<WorkerPool>,
    backend: Arc<dyn ModelBackend>,
    health: HealthMonitor,
    backend_timeout: Duration,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
}

impl InferenceGate {
    /// Build the full stack from config.
    ///
    /// When `redis_url` is configured but unreachable, construction logs a
    /// warning and falls back to the in-memory store: the cache is an
    /// optimization and must never keep the service from starting.
    pub async fn new(config: EngineConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let store: Arc<dyn CacheStore> = match &config.redis_url {
            Some(url) => match RedisStore::new(url).await {
                Ok(store) => {
                    info!(url, "Result cache connected to Redis");
                    Arc::new(store)
                }
                Err(err) => {
                    warn!(url, error = %err, "Redis unavailable, using in-memory cache store");
                    Arc::new(MemoryStore::new())
                }
            },
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, backend, store)
    }

    /// Build with an explicit cache store.
    pub fn with_store(
        config: EngineConfig,
        backend: Arc<dyn ModelBackend>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::new(config.quota_warn_fraction));
        let gate = RequestGate::new(ledger.clone(), config.endpoint_limits.clone());
        let cache = Arc::new(ResultCache::new(
            store,
            Duration::from_secs(config.translation_ttl_secs),
            Duration::from_secs(config.transcription_ttl_secs),
        ));
        let breakers = Arc::new(BreakerRegistry::new(CircuitConfig {
            failure_threshold: config.breaker_failure_threshold,
            recovery_timeout: Duration::from_secs(config.breaker_recovery_secs),
        }));
        let retry_policy = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: true,
        };
        let pool = Arc::new(WorkerPool::new(config.worker_count, config.queue_bound));

        let health = HealthMonitor::new(Duration::from_millis(config.health_check_timeout_ms))
            .with_check(Arc::new(BackendLoadedCheck::new(backend.clone())))
            .with_check(Arc::new(CacheReachableCheck::new(cache.clone())))
            .with_check(Arc::new(BreakerStateCheck::new(breakers.clone())))
            .with_check(Arc::new(PoolSaturationCheck::new(pool.clone())));

        Self {
            gate,
            ledger,
            cache,
            breakers,
            retry_policy,
            pool,
            backend,
            health,
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        }
    }

    /// Register an extra readiness check (CPU/GPU probes and the like).
    pub fn register_health_check(&mut self, check: Arc<dyn HealthCheck>) {
        self.health.register(check);
    }

    /// Translate text, going through the full admission and resilience
    /// chain. Identical inputs hit the cache and never reach the backend.
    pub async fn translate(
        &self,
        ctx: &RequestContext,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<GateResponse, GateError> {
        let _timer = LatencyTimer::new("translate");
        validate_translation(text, source_lang, target_lang)?;

        let estimate = ResourceEstimate::translation(text);
        let admission = self.gate.admit(ctx, "/translate", &estimate)?;
        let result = self.run_translation(text, source_lang, target_lang).await;
        self.settle(ctx, "translate", admission, result)
    }

    /// Transcribe audio through the same chain.
    pub async fn transcribe(
        &self,
        ctx: &RequestContext,
        audio: &[u8],
        language_hint: Option<&str>,
    ) -> Result<GateResponse, GateError> {
        let _timer = LatencyTimer::new("transcribe");
        if audio.is_empty() {
            return Err(GateError::Validation("audio payload is empty".into()));
        }

        let estimate = ResourceEstimate::transcription(audio.len() as u64);
        let admission = self.gate.admit(ctx, "/transcribe", &estimate)?;
        let result = self.run_transcription(audio, language_hint).await;
        self.settle(ctx, "transcribe", admission, result)
    }

    /// Transcribe audio, then translate the transcript: one admission, one
    /// settlement, both stages individually cached.
    pub async fn process_audio(
        &self,
        ctx: &RequestContext,
        audio: &[u8],
        language_hint: Option<&str>,
        target_lang: &str,
    ) -> Result<GateResponse, GateError> {
        let _timer = LatencyTimer::new("process_audio");
        if audio.is_empty() {
            return Err(GateError::Validation("audio payload is empty".into()));
        }
        if target_lang.trim().is_empty() {
            return Err(GateError::Validation("target language is empty".into()));
        }

        // Both stages charged up front
        let mut estimate = ResourceEstimate::transcription(audio.len() as u64);
        estimate.compute_seconds += 1;
        let admission = self.gate.admit(ctx, "/process_audio", &estimate)?;

        let source = language_hint.unwrap_or("auto").to_string();
        let result = async {
            let transcript = self.run_transcription(audio, language_hint).await?;
            self.run_translation(&transcript.output, &source, target_lang)
                .await
                .map(|r| GateResponse {
                    cache_hit: transcript.cache_hit && r.cache_hit,
                    ..r
                })
        }
        .await;
        self.settle(ctx, "process_audio", admission, result)
    }

    /// Translate a batch concurrently, bounded by the worker pool.
    ///
    /// Each item is admitted, executed, and settled independently; one
    /// item's failure leaves the others untouched. Results come back in
    /// input order.
    pub async fn translate_batch(
        self: Arc<Self>,
        ctx: &RequestContext,
        items: Vec<TranslationRequest>,
    ) -> Vec<Result<GateResponse, GateError>> {
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let engine = self.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .translate(&ctx, &item.text, &item.source_lang, &item.target_lang)
                    .await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(_) => Err(GateError::Internal),
            });
        }
        results
    }

    /// Current usage for a principal, for the account API.
    #[must_use]
    pub fn usage_summary(&self, principal: &Principal) -> UsageSummary {
        self.ledger.usage_summary(principal)
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.health.liveness()
    }

    pub async fn readiness(&self) -> HealthReport {
        self.health.readiness().await
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            breakers: self.breakers.snapshots(),
            pool: self.pool.stats(),
        }
    }

    /// Drop idle admission state. Run from a periodic maintenance task.
    pub fn prune(&self) {
        self.gate.prune();
    }

    /// Settle the admission against the outcome and record counters.
    fn settle(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        admission: crate::limits::Admission,
        result: Result<GateResponse, GateError>,
    ) -> Result<GateResponse, GateError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(mut response) => {
                response.rate = Some(admission.rate.clone());
                self.gate.commit(admission);
                crate::metrics::record_request(operation, "success");
                response.request_id = ctx.request_id;
                Ok(response)
            }
            Err(err) => {
                self.gate.rollback(admission);
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_request(operation, "failure");
                warn!(
                    request_id = %ctx.request_id,
                    operation,
                    reason = err.reason_code(),
                    "Request failed"
                );
                Err(err)
            }
        }
    }

    /// Ensure the backend's one-time load has happened.
    async fn ensure_loaded(&self) -> Result<(), GateError> {
        let backend = self.backend.clone();
        self.pool
            .initialize_once(|| async move { backend.load().await.map_err(GateError::from) })
            .await
    }

    async fn run_translation(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<GateResponse, GateError> {
        self.ensure_loaded().await?;

        let fingerprint = Fingerprint::translation(text, source_lang, target_lang);
        if let Some(artifact) = self.cache.get(&fingerprint).await {
            return Ok(cached_response(artifact, true));
        }

        let breaker = self.breakers.get(TRANSLATION_CIRCUIT);
        let timeout = self.backend_timeout;
        let output = retry(TRANSLATION_CIRCUIT, &self.retry_policy, || {
            let breaker = breaker.clone();
            let pool = self.pool.clone();
            let backend = self.backend.clone();
            let text = text.to_string();
            let source = source_lang.to_string();
            let target = target_lang.to_string();
            async move {
                breaker
                    .execute(|| {
                        pool.run(async move {
                            deadline(timeout, backend.translate(&text, &source, &target)).await
                        })
                    })
                    .await
            }
        })
        .await;
        crate::metrics::record_backend_call(
            TRANSLATION_CIRCUIT,
            if output.is_ok() { "success" } else { "failure" },
        );

        let artifact = CachedArtifact::new(ArtifactKind::Translation, output?);
        self.cache.put(&fingerprint, &artifact).await;
        Ok(cached_response(artifact, false))
    }

    async fn run_transcription(
        &self,
        audio: &[u8],
        language_hint: Option<&str>,
    ) -> Result<GateResponse, GateError> {
        self.ensure_loaded().await?;

        let fingerprint = Fingerprint::transcription(audio, language_hint);
        if let Some(artifact) = self.cache.get(&fingerprint).await {
            return Ok(cached_response(artifact, true));
        }

        let breaker = self.breakers.get(TRANSCRIPTION_CIRCUIT);
        let timeout = self.backend_timeout;
        let output = retry(TRANSCRIPTION_CIRCUIT, &self.retry_policy, || {
            let breaker = breaker.clone();
            let pool = self.pool.clone();
            let backend = self.backend.clone();
            let audio = audio.to_vec();
            let hint = language_hint.map(str::to_string);
            async move {
                breaker
                    .execute(|| {
                        pool.run(async move {
                            deadline(timeout, backend.transcribe(&audio, hint.as_deref())).await
                        })
                    })
                    .await
            }
        })
        .await;
        crate::metrics::record_backend_call(
            TRANSCRIPTION_CIRCUIT,
            if output.is_ok() { "success" } else { "failure" },
        );

        let artifact = CachedArtifact::new(ArtifactKind::Transcription, output?);
        self.cache.put(&fingerprint, &artifact).await;
        Ok(cached_response(artifact, false))
    }
}

/// Run a backend call against the configured deadline. A missed deadline
/// is a [`BackendError::Timeout`]: breaker-counted and retry-eligible like
/// any other backend failure.
async fn deadline<Fut>(timeout: Duration, call: Fut) -> Result<String, GateError>
where
    Fut: std::future::Future<Output = Result<String, BackendError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(GateError::Backend(err)),
        Err(_) => Err(GateError::Backend(BackendError::Timeout(timeout))),
    }
}

fn cached_response(artifact: CachedArtifact, cache_hit: bool) -> GateResponse {
    GateResponse {
        request_id: Uuid::nil(), // overwritten in settle
        kind: artifact.kind,
        output: artifact.output,
        cache_hit,
        rate: None,
    }
}

fn validate_translation(text: &str, source_lang: &str, target_lang: &str) -> Result<(), GateError> {
    if text.trim().is_empty() {
        return Err(GateError::Validation("text is empty".into()));
    }
    if source_lang.trim().is_empty() || target_lang.trim().is_empty() {
        return Err(GateError::Validation("language codes must be non-empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::principal::Tier;

    fn config() -> EngineConfig {
        EngineConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn engine_with(backend: Arc<ScriptedBackend>) -> Arc<InferenceGate> {
        Arc::new(InferenceGate::with_store(
            config(),
            backend,
            Arc::new(MemoryStore::new()),
        ))
    }

    fn ctx(tier: Tier) -> RequestContext {
        RequestContext::new(Principal::new("alice", tier))
    }

    #[tokio::test]
    async fn test_translate_happy_path() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend.clone());
        let ctx = ctx(Tier::Pro);

        let response = engine.translate(&ctx, "hello", "en", "es").await.unwrap();
        assert_eq!(response.output, "[en->es] hello");
        assert_eq!(response.kind, ArtifactKind::Translation);
        assert!(!response.cache_hit);
        assert_eq!(response.request_id, ctx.request_id);
        // Lazy load happened exactly once
        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_second_identical_request_hits_cache() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend.clone());
        let ctx = ctx(Tier::Pro);

        let first = engine.translate(&ctx, "hello", "en", "es").await.unwrap();
        let second = engine.translate(&ctx, "hello", "en", "es").await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.output, second.output);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_admission() {
        let engine = engine_with(Arc::new(ScriptedBackend::new()));
        let ctx = ctx(Tier::Free);

        assert!(matches!(
            engine.translate(&ctx, "   ", "en", "es").await,
            Err(GateError::Validation(_))
        ));
        assert!(matches!(
            engine.transcribe(&ctx, &[], None).await,
            Err(GateError::Validation(_))
        ));
        // Nothing was charged
        let usage = engine.usage_summary(&ctx.principal);
        assert_eq!(usage.usage["requests"].used, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.load().await.unwrap();
        backend.script_failure(BackendError::Transient("gpu hiccup".into()));
        let engine = engine_with(backend.clone());
        let ctx = ctx(Tier::Pro);

        let response = engine.translate(&ctx, "hello", "en", "es").await.unwrap();
        assert_eq!(response.output, "[en->es] hello");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_rolls_back_quota() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.load().await.unwrap();
        backend.script_failure(BackendError::Permanent("unsupported pair".into()));
        let engine = engine_with(backend);
        let ctx = ctx(Tier::Free);

        let err = engine.translate(&ctx, "hello", "en", "xx").await.unwrap_err();
        assert!(matches!(err, GateError::Backend(BackendError::Permanent(_))));

        let usage = engine.usage_summary(&ctx.principal);
        assert_eq!(usage.usage["requests"].used, 0);
        assert_eq!(usage.usage["requests"].reserved, 0);
    }

    #[tokio::test]
    async fn test_process_audio_pipeline() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend.clone());
        let ctx = ctx(Tier::Pro);

        let response = engine
            .process_audio(&ctx, &[1u8; 320], Some("es"), "en")
            .await
            .unwrap();
        assert_eq!(response.kind, ArtifactKind::Translation);
        assert!(response.output.contains("transcript[320 bytes, lang=es]"));
        // Both stages reached the backend
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend);
        let ctx = ctx(Tier::Pro);

        let items = vec![
            TranslationRequest {
                text: "uno".into(),
                source_lang: "es".into(),
                target_lang: "en".into(),
            },
            TranslationRequest {
                text: "".into(), // fails validation
                source_lang: "es".into(),
                target_lang: "en".into(),
            },
            TranslationRequest {
                text: "tres".into(),
                source_lang: "es".into(),
                target_lang: "en".into(),
            },
        ];

        let results = engine.clone().translate_batch(&ctx, items).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(GateError::Validation(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_metrics_snapshot_counts() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend);
        let ctx = ctx(Tier::Pro);

        engine.translate(&ctx, "hello", "en", "es").await.unwrap();
        engine.translate(&ctx, "hello", "en", "es").await.unwrap();

        let snapshot = engine.metrics_snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_failed, 0);
        assert_eq!(snapshot.cache.hits, 1);
        assert_eq!(snapshot.cache.misses, 1);
        assert_eq!(snapshot.pool.completed, 1);
        assert!(!snapshot.breakers.is_empty());
    }

    #[tokio::test]
    async fn test_readiness_degrades_before_load() {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = engine_with(backend.clone());

        // Model not loaded: critical check fails
        let report = engine.readiness().await;
        assert_eq!(report.status, crate::health::HealthStatus::Unhealthy);

        backend.load().await.unwrap();
        let report = engine.readiness().await;
        assert_eq!(report.status, crate::health::HealthStatus::Healthy);

        assert!(engine.liveness().alive);
    }
}
