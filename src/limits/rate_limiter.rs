// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sliding-window rate limiter.
//!
//! Uses the two-bucket weighted approximation: each (principal, endpoint)
//! pair keeps counters for the current and previous window, and the
//! effective count is `current + previous * (1 - overlap_fraction)`. This
//! avoids the classic fixed-window defect where a burst straddling a window
//! edge can pass at 2x the limit. Check-and-increment happens under the
//! DashMap entry lock, so concurrent callers on the same key never
//! double-admit.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Counters for one (principal, endpoint) pair.
struct WindowState {
    /// Start of the current window, epoch millis aligned to window length
    window_start_ms: i64,
    current: u32,
    previous: u32,
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the window after this decision
    pub remaining: u32,
    /// When the current window rolls over
    pub reset_at: DateTime<Utc>,
}

/// Weighted sliding-window limiter keyed by (principal_id, endpoint).
pub struct SlidingWindowLimiter {
    windows: DashMap<(String, String), WindowState>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check and, if allowed, count one request against the window.
    ///
    /// A single atomic operation: the entry lock is held from read through
    /// increment, so the decision can never admit past `limit` under
    /// concurrent same-key callers.
    pub fn check(
        &self,
        principal_id: &str,
        endpoint: &str,
        limit: u32,
        window: Duration,
    ) -> RateDecision {
        self.check_at(principal_id, endpoint, limit, window, Utc::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock, for tests.
    pub fn check_at(
        &self,
        principal_id: &str,
        endpoint: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let window_ms = window.as_millis().max(1) as i64;
        let now_ms = now.timestamp_millis();
        let aligned_ms = now_ms - now_ms.rem_euclid(window_ms);

        let key = (principal_id.to_string(), endpoint.to_string());
        let mut entry = self.windows.entry(key).or_insert_with(|| WindowState {
            window_start_ms: aligned_ms,
            current: 0,
            previous: 0,
        });

        // Roll the window forward if time moved past its edge
        if aligned_ms > entry.window_start_ms {
            entry.previous = if aligned_ms - entry.window_start_ms == window_ms {
                entry.current
            } else {
                0
            };
            entry.current = 0;
            entry.window_start_ms = aligned_ms;
        }

        let overlap = 1.0 - (now_ms - aligned_ms) as f64 / window_ms as f64;
        let weighted = entry.current as f64 + entry.previous as f64 * overlap;

        let reset_at = Self::epoch_ms(aligned_ms + window_ms);
        if weighted + 1.0 <= limit as f64 {
            entry.current += 1;
            let remaining = (limit as f64 - weighted - 1.0).floor().max(0.0) as u32;
            RateDecision {
                allowed: true,
                limit,
                remaining,
                reset_at,
            }
        } else {
            debug!(
                principal = principal_id,
                endpoint,
                limit,
                weighted = format!("{weighted:.1}"),
                "Rate limit exceeded"
            );
            RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
            }
        }
    }

    /// Drop state that has been idle for at least two full windows.
    ///
    /// Keeps memory bounded by active principals rather than all principals
    /// ever seen. Intended to run from a periodic maintenance task.
    pub fn prune(&self, window: Duration) -> usize {
        let window_ms = window.as_millis().max(1) as i64;
        let cutoff = Utc::now().timestamp_millis() - 2 * window_ms;
        let before = self.windows.len();
        self.windows.retain(|_, state| state.window_start_ms >= cutoff);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, "Pruned idle rate-limit windows");
        }
        removed
    }

    /// Number of tracked (principal, endpoint) pairs.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn epoch_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn at(epoch_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch_secs, 0).single().unwrap()
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = SlidingWindowLimiter::new();
        let now = at(1_000_020);

        for i in 0..10 {
            let d = limiter.check_at("alice", "/translate", 10, WINDOW, now);
            assert!(d.allowed, "request {i} should be allowed");
        }
        let d = limiter.check_at("alice", "/translate", 10, WINDOW, now);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn test_reset_at_is_window_edge() {
        let limiter = SlidingWindowLimiter::new();
        // 1_000_020 is 20s into the minute starting at 1_000_020 - 1_000_020 % 60
        let now = at(1_000_020);
        let d = limiter.check_at("alice", "/translate", 10, WINDOW, now);

        assert!(d.allowed);
        assert!(d.reset_at > now);
        assert_eq!(d.reset_at.timestamp() % 60, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        let now = at(1_000_000);

        for _ in 0..5 {
            assert!(limiter.check_at("alice", "/translate", 5, WINDOW, now).allowed);
        }
        assert!(!limiter.check_at("alice", "/translate", 5, WINDOW, now).allowed);

        // Different endpoint and different principal are fresh windows
        assert!(limiter.check_at("alice", "/transcribe", 5, WINDOW, now).allowed);
        assert!(limiter.check_at("bob", "/translate", 5, WINDOW, now).allowed);
    }

    #[test]
    fn test_no_edge_double_counting() {
        let limiter = SlidingWindowLimiter::new();
        let window_start = at(1_000_020 - 1_000_020 % 60);

        // Fill the limit just before the window edge
        let late = window_start + chrono::Duration::seconds(59);
        for _ in 0..10 {
            assert!(limiter.check_at("alice", "/t", 10, WINDOW, late).allowed);
        }

        // Just past the edge the previous window still weighs in heavily,
        // so a fresh burst of 10 must not be admitted.
        let early_next = window_start + chrono::Duration::seconds(61);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.check_at("alice", "/t", 10, WINDOW, early_next).allowed {
                admitted += 1;
            }
        }
        assert!(admitted <= 1, "admitted {admitted} just past the edge");
    }

    #[test]
    fn test_old_window_fully_expires() {
        let limiter = SlidingWindowLimiter::new();
        let now = at(1_000_020);

        for _ in 0..10 {
            assert!(limiter.check_at("alice", "/t", 10, WINDOW, now).allowed);
        }
        assert!(!limiter.check_at("alice", "/t", 10, WINDOW, now).allowed);

        // Two full windows later nothing carries over
        let later = now + chrono::Duration::seconds(130);
        let d = limiter.check_at("alice", "/t", 10, WINDOW, later);
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
    }

    #[test]
    fn test_prune_drops_idle_keys() {
        let limiter = SlidingWindowLimiter::new();
        let stale = Utc::now() - chrono::Duration::seconds(300);

        limiter.check_at("old", "/t", 10, WINDOW, stale);
        limiter.check("fresh", "/t", 10, WINDOW);
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.prune(WINDOW);
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_concurrent_same_key_never_over_admits() {
        use std::sync::Arc;

        let limiter = Arc::new(SlidingWindowLimiter::new());
        let now = at(1_000_010);
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0u32;
                for _ in 0..10 {
                    if limiter.check_at("alice", "/t", 20, WINDOW, now).allowed {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 20);
    }
}
