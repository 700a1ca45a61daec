//! # Inference Gate
//!
//! The resilience and concurrency control plane that sits between inbound
//! API requests and expensive, failure-prone model backends (speech
//! transcription, text translation).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RequestGate                            │
//! │  • Identity + payload validation                            │
//! │  • Sliding-window rate limiting per principal/endpoint      │
//! │  • Daily quota reservation (commit/rollback on outcome)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ admitted
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ResultCache                            │
//! │  • SHA-256 content fingerprints                             │
//! │  • Schema-constrained JSON envelopes, per-kind TTLs         │
//! │  • Degrades to pass-through when the store is down          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Retry → CircuitBreaker → WorkerPool              │
//! │  • Exponential backoff with jitter, transient-only          │
//! │  • Per-dependency breakers, single half-open probe          │
//! │  • Bounded workers + bounded queue, ServiceBusy beyond      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                        model backend
//! ```
//!
//! The [`HealthMonitor`] polls every layer independently of the request
//! path and folds the results into one liveness/readiness surface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inference_gate::{
//!     EngineConfig, InferenceGate, Principal, RequestContext, ScriptedBackend, Tier,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         worker_count: 4,
//!         ..Default::default()
//!     };
//!
//!     let backend = Arc::new(ScriptedBackend::new());
//!     let engine = Arc::new(InferenceGate::new(config, backend).await);
//!
//!     let ctx = RequestContext::new(Principal::new("user-1", Tier::Pro));
//!     match engine.translate(&ctx, "hello world", "en", "es").await {
//!         Ok(response) => println!("{} (cached: {})", response.output, response.cache_hit),
//!         Err(err) => eprintln!("{} ({})", err, err.reason_code()),
//!     }
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **No edge double-counting**: the rate limiter is a weighted sliding
//!   window, not a fixed-window counter.
//! - **No charge for system failures**: quota is reserved at admission and
//!   only committed after the backend succeeds.
//! - **Fail fast on known-down dependencies**: breaker-open errors bypass
//!   the retry budget entirely.
//! - **Bounded everything**: worker concurrency, queue depth, per-check
//!   health timeouts, and cache TTLs are all explicit limits.

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod limits;
pub mod metrics;
pub mod orchestrator;
pub mod principal;
pub mod resilience;

pub use backend::{ModelBackend, ScriptedBackend};
pub use cache::{ArtifactKind, CacheStore, CachedArtifact, Fingerprint, MemoryStore, ResultCache};
pub use config::EngineConfig;
pub use engine::{GateResponse, InferenceGate, MetricsSnapshot, TranslationRequest};
pub use error::{BackendError, GateError};
pub use health::{CheckOutcome, FnCheck, HealthCheck, HealthMonitor, HealthReport, HealthStatus};
pub use limits::{Admission, QuotaLedger, RequestGate, ResourceEstimate, SlidingWindowLimiter};
pub use orchestrator::WorkerPool;
pub use principal::{Principal, RequestContext, Resource, Tier, TierLimits};
pub use resilience::circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use resilience::retry::{retry, RetryPolicy};
