// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The admission gate: one decision combining identity, payload size,
//! rate limiting, and quota reservation.
//!
//! Check order is fixed: identity validity, payload cap, rate window,
//! then quota. The first failure rejects with a structured reason and a
//! retry-after hint; the gate never retries on the caller's behalf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::GateError;
use crate::limits::quota::{QuotaLedger, Reservation};
use crate::limits::rate_limiter::{RateDecision, SlidingWindowLimiter};
use crate::principal::{RequestContext, Resource};

/// PCM byte rate assumed when estimating audio duration from payload size
/// (16 kHz mono, 16-bit samples).
const PCM_BYTES_PER_SEC: u64 = 32_000;

/// Predicted resource cost of a request, charged against daily quotas.
#[derive(Debug, Clone, Default)]
pub struct ResourceEstimate {
    pub payload_bytes: u64,
    pub compute_seconds: u64,
    pub audio_minutes: u64,
}

impl ResourceEstimate {
    /// Text translation: flat one compute-second per request.
    #[must_use]
    pub fn translation(text: &str) -> Self {
        Self {
            payload_bytes: text.len() as u64,
            compute_seconds: 1,
            audio_minutes: 0,
        }
    }

    /// Audio transcription: duration estimated from payload size assuming
    /// 16 kHz mono 16-bit PCM, rounded up and never below one minute.
    #[must_use]
    pub fn transcription(audio_bytes: u64) -> Self {
        let seconds = audio_bytes.div_ceil(PCM_BYTES_PER_SEC).max(1);
        Self {
            payload_bytes: audio_bytes,
            compute_seconds: seconds,
            audio_minutes: seconds.div_ceil(60).max(1),
        }
    }
}

/// A granted admission holding the quota reservations for one request.
///
/// Settle exactly once via [`RequestGate::commit`] on backend success or
/// [`RequestGate::rollback`] on backend failure.
#[derive(Debug)]
#[must_use = "admissions must be committed or rolled back"]
pub struct Admission {
    pub rate: RateDecision,
    reservations: Vec<Reservation>,
}

/// Composes the rate limiter and quota ledger into a single admission
/// decision. Built once at startup and shared by reference.
pub struct RequestGate {
    limiter: SlidingWindowLimiter,
    ledger: Arc<QuotaLedger>,
    /// Per-endpoint per-minute overrides; tier rpm applies otherwise
    endpoint_limits: HashMap<String, u32>,
}

impl RequestGate {
    pub fn new(ledger: Arc<QuotaLedger>, endpoint_limits: HashMap<String, u32>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(),
            ledger,
            endpoint_limits,
        }
    }

    /// Run the full admission chain for one request.
    pub fn admit(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        estimate: &ResourceEstimate,
    ) -> Result<Admission, GateError> {
        let principal = &ctx.principal;
        if !principal.is_valid() {
            return Err(GateError::Auth("invalid principal".into()));
        }

        let limits = principal.tier.limits();
        if estimate.payload_bytes > limits.max_payload_bytes as u64 {
            return Err(GateError::Validation(format!(
                "payload of {} bytes exceeds the tier limit of {} bytes",
                estimate.payload_bytes, limits.max_payload_bytes
            )));
        }

        let per_minute = self
            .endpoint_limits
            .get(endpoint)
            .copied()
            .unwrap_or(limits.requests_per_minute)
            .min(limits.requests_per_minute);
        let rate = self
            .limiter
            .check(&principal.id, endpoint, per_minute, Duration::from_secs(60));
        if !rate.allowed {
            crate::metrics::record_rejection("rate_limited");
            return Err(GateError::RateLimited {
                reset_at: rate.reset_at,
            });
        }

        let mut reservations = Vec::with_capacity(3);
        let wanted = [
            (Resource::Requests, 1),
            (Resource::ComputeSeconds, estimate.compute_seconds),
            (Resource::AudioMinutes, estimate.audio_minutes),
        ];
        for (resource, amount) in wanted {
            if amount == 0 {
                continue;
            }
            match self.ledger.reserve(principal, resource, amount) {
                Ok(r) => reservations.push(r),
                Err(err) => {
                    // Release anything reserved before the failing resource
                    for held in reservations {
                        self.ledger.rollback(held);
                    }
                    crate::metrics::record_rejection("quota_exceeded");
                    return Err(err);
                }
            }
        }

        debug!(
            request_id = %ctx.request_id,
            principal = %principal.id,
            endpoint,
            remaining = rate.remaining,
            "Request admitted"
        );
        Ok(Admission { rate, reservations })
    }

    /// Charge the admission's reservations after a successful call.
    pub fn commit(&self, admission: Admission) {
        for r in admission.reservations {
            self.ledger.commit(r);
        }
    }

    /// Release the admission's reservations after a failed call.
    pub fn rollback(&self, admission: Admission) {
        for r in admission.reservations {
            self.ledger.rollback(r);
        }
    }

    /// Drop idle rate windows and stale quota counters.
    pub fn prune(&self) {
        self.limiter.prune(Duration::from_secs(60));
        self.ledger.prune();
    }
}
