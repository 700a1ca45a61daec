// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the request path.
//!
//! Two layers of errors flow through the gate:
//! - [`BackendError`] — failures raised by the model backends (transient,
//!   permanent, timeout). Only these are eligible for retry.
//! - [`GateError`] — everything the caller can see: admission rejections,
//!   breaker-open fail-fast, backpressure, and wrapped backend failures.
//!
//! Cache-store failures never appear here: the result cache degrades to
//! always-miss and the request proceeds without it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::principal::Resource;

/// Failure modes of the model backend collaborators.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Recoverable failure (connection reset, GPU OOM, throttling upstream)
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Non-recoverable failure (malformed model output, unsupported language)
    #[error("permanent backend failure: {0}")]
    Permanent(String),

    /// The backend call exceeded its deadline
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Whether this failure kind is on the retry allow-list.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors surfaced to the HTTP layer.
///
/// Every rejection carries a machine-readable [`reason_code`](Self::reason_code)
/// and, where meaningful, a [`retry_after`](Self::retry_after) hint.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// Malformed or oversized input. Never retried, never consumes quota.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown or invalid principal. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Sliding-window rate limit exceeded.
    #[error("rate limit exceeded, window resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// Daily quota exhausted for a resource.
    #[error("daily quota exceeded for {resource}, resets at {reset_at}")]
    QuotaExceeded {
        resource: Resource,
        reset_at: DateTime<Utc>,
    },

    /// Circuit breaker is open; the backend was not invoked.
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Worker pool queue is full; explicit backpressure.
    #[error("service busy, worker queue is full")]
    ServiceBusy,

    /// A backend failure that survived the retry policy.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Unclassified failure. Internals are logged, not leaked.
    #[error("internal error")]
    Internal,
}

impl GateError {
    /// Whether the retry policy may spend budget on this error.
    ///
    /// Breaker-open, admission rejections, and permanent failures all
    /// propagate immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_retryable())
    }

    /// Whether this failure counts toward a circuit breaker's threshold.
    ///
    /// Only backend outcomes say anything about the dependency's health;
    /// local backpressure and admission rejections do not.
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Stable machine-readable reason code for response bodies.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "auth_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ServiceBusy => "service_busy",
            Self::Backend(BackendError::Transient(_)) => "backend_transient",
            Self::Backend(BackendError::Permanent(_)) => "backend_permanent",
            Self::Backend(BackendError::Timeout(_)) => "backend_timeout",
            Self::Internal => "internal_error",
        }
    }

    /// Retry-After hint in seconds, where one makes sense.
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { reset_at } | Self::QuotaExceeded { reset_at, .. } => {
                let secs = (*reset_at - Utc::now()).num_seconds();
                Some(secs.max(1) as u64)
            }
            Self::CircuitOpen { retry_after, .. } => Some(retry_after.as_secs().max(1)),
            Self::ServiceBusy => Some(1),
            _ => None,
        }
    }

    /// Suggested HTTP status code.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::RateLimited { .. } | Self::QuotaExceeded { .. } => 429,
            Self::CircuitOpen { .. } | Self::ServiceBusy => 503,
            Self::Backend(BackendError::Timeout(_)) => 504,
            Self::Backend(_) => 502,
            Self::Internal => 500,
        }
    }
}
