// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Only failures on the explicit allow-list (transient backend errors and
//! timeouts) consume retry budget; permanent failures, admission rejections,
//! and breaker-open errors propagate immediately so a known-down dependency
//! is never hammered.
//!
//! # Example
//!
//! ```
//! use inference_gate::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_attempts, 3);
//!
//! // Delay grows as base * 2^(attempt-1), capped at max_delay
//! assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
//! assert_eq!(policy.backoff_ceiling(2), Duration::from_secs(2));
//! assert_eq!(policy.backoff_ceiling(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::GateError;

/// Configuration for retry behavior around backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first call
    pub max_attempts: usize,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Add uniform jitter in `[0, delay)` to avoid synchronized retry storms
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Tight policy for latency-sensitive paths.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }

    /// Fast policy for tests (minimal delays, no jitter)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    /// Upper bound of the delay after `attempt` (1-based): `min(max, base * 2^(attempt-1))`.
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as u32;
        let scaled = self
            .base_delay
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.max_delay);
        scaled.min(self.max_delay)
    }

    /// Concrete delay for an attempt, with jitter applied if enabled.
    fn delay_for(&self, attempt: usize) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if self.jitter && !ceiling.is_zero() {
            ceiling.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        } else {
            ceiling
        }
    }
}

/// Run `operation`, retrying retryable failures up to the policy's budget.
///
/// Non-retryable errors (validation, permanent backend failures,
/// `CircuitOpen`, admission rejections) return immediately without
/// consuming budget.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, GateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GateError>>,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retries"
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                if !err.is_retryable() || attempt >= policy.max_attempts {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
