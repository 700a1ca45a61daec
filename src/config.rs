//! Configuration for the inference gate.
//!
//! # Example
//!
//! ```
//! use inference_gate::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.worker_count, 4);
//!
//! // Full config
//! let config = EngineConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     worker_count: 8,
//!     queue_bound: 64,
//!     breaker_failure_threshold: 3,
//!     ..Default::default()
//! };
//! ```

use std::collections::HashMap;

use serde::Deserialize;

/// Configuration for the inference gate.
///
/// All fields have sensible defaults. The values are expected to arrive from
/// an external config loader; this crate only consumes the typed struct.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Redis connection string for the result cache (e.g., "redis://localhost:6379").
    /// When unset the in-memory store is used.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Number of workers executing model-backend calls concurrently
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Queued submissions allowed beyond the worker count before ServiceBusy
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,

    /// Deadline for a single backend call
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Circuit breaker: consecutive failures before tripping
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Circuit breaker: seconds in OPEN before a half-open probe is allowed
    #[serde(default = "default_breaker_recovery_secs")]
    pub breaker_recovery_secs: u64,

    /// Retry: attempts including the first call
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    /// Retry: first backoff delay
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Retry: backoff cap
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Cache TTL for translation artifacts (text in, text out — long-lived)
    #[serde(default = "default_translation_ttl_secs")]
    pub translation_ttl_secs: u64,

    /// Cache TTL for transcription artifacts
    #[serde(default = "default_transcription_ttl_secs")]
    pub transcription_ttl_secs: u64,

    /// Per-endpoint sliding-window overrides (requests per minute).
    /// Endpoints absent from the map are governed only by the tier limit.
    #[serde(default)]
    pub endpoint_limits: HashMap<String, u32>,

    /// Fraction of a daily quota at which the warning hook fires
    #[serde(default = "default_quota_warn_fraction")]
    pub quota_warn_fraction: f64,

    /// Per-check timeout for readiness sub-checks
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

fn default_worker_count() -> usize { 4 }
fn default_queue_bound() -> usize { 32 }
fn default_backend_timeout_ms() -> u64 { 30_000 }
fn default_breaker_failure_threshold() -> u32 { 5 }
fn default_breaker_recovery_secs() -> u64 { 60 }
fn default_retry_max_attempts() -> usize { 3 }
fn default_retry_base_delay_ms() -> u64 { 1_000 }
fn default_retry_max_delay_ms() -> u64 { 60_000 }
fn default_translation_ttl_secs() -> u64 { 86_400 } // 24 h
fn default_transcription_ttl_secs() -> u64 { 3_600 } // 1 h
fn default_quota_warn_fraction() -> f64 { 0.8 }
fn default_health_check_timeout_ms() -> u64 { 5_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            worker_count: default_worker_count(),
            queue_bound: default_queue_bound(),
            backend_timeout_ms: default_backend_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_recovery_secs: default_breaker_recovery_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            translation_ttl_secs: default_translation_ttl_secs(),
            transcription_ttl_secs: default_transcription_ttl_secs(),
            endpoint_limits: HashMap::new(),
            quota_warn_fraction: default_quota_warn_fraction(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}
