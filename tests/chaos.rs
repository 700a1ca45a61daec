//! Property and contention tests.
//!
//! Proptest drives the pure invariants (fingerprints, backoff, windows,
//! quota arithmetic); tokio tests hammer the shared-state components with
//! concurrent callers to catch races the unit tests can't.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use inference_gate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use inference_gate::{
    BackendError, CircuitState, Fingerprint, GateError, Principal, QuotaLedger, Resource,
    RetryPolicy, SlidingWindowLimiter, Tier, WorkerPool,
};

// =============================================================================
// Proptest: pure invariants
// =============================================================================

proptest! {
    #[test]
    fn prop_fingerprint_deterministic(text in ".{0,200}", src in "[a-zA-Z]{2,5}", dst in "[a-zA-Z]{2,5}") {
        let a = Fingerprint::translation(&text, &src, &dst);
        let b = Fingerprint::translation(&text, &src, &dst);
        prop_assert_eq!(a.as_hex(), b.as_hex());
        prop_assert_eq!(a.as_hex().len(), 64);
    }

    #[test]
    fn prop_fingerprint_normalization(text in "[a-z ]{1,50}", src in "[a-z]{2}", dst in "[a-z]{2}") {
        let canonical = Fingerprint::translation(text.trim(), &src, &dst);
        let padded = Fingerprint::translation(&format!("  {text} "), &src.to_uppercase(), &dst);
        prop_assert_eq!(canonical, padded);
    }

    #[test]
    fn prop_transcription_keyed_by_bytes(audio in proptest::collection::vec(any::<u8>(), 0..512)) {
        let a = Fingerprint::transcription(&audio, None);
        let b = Fingerprint::transcription(&audio, None);
        prop_assert_eq!(&a, &b);

        let mut tweaked = audio.clone();
        tweaked.push(0xFF);
        prop_assert_ne!(a, Fingerprint::transcription(&tweaked, None));
    }

    #[test]
    fn prop_backoff_monotonic_and_bounded(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempts in 1usize..20,
    ) {
        let policy = RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: false,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.backoff_ceiling(attempt);
            prop_assert!(delay >= previous, "delay decreased at attempt {}", attempt);
            prop_assert!(delay <= policy.max_delay.max(policy.base_delay));
            previous = delay;
        }
    }

    #[test]
    fn prop_window_never_admits_past_limit(
        limit in 1u32..100,
        calls in 1usize..300,
        offset_ms in 0i64..60_000,
    ) {
        let limiter = SlidingWindowLimiter::new();
        let now = Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).single().unwrap();

        let mut admitted = 0u32;
        for _ in 0..calls {
            if limiter.check_at("p", "/e", limit, Duration::from_secs(60), now).allowed {
                admitted += 1;
            }
        }
        prop_assert_eq!(admitted, limit.min(calls as u32));
    }

    #[test]
    fn prop_quota_commit_rollback_conserves(
        amounts in proptest::collection::vec((1u64..50, any::<bool>()), 1..40),
    ) {
        let ledger = QuotaLedger::new(1.0);
        let alice = Principal::new("alice", Tier::Enterprise);
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap();

        let mut expected_committed = 0u64;
        for (amount, commit) in amounts {
            let Ok(reservation) = ledger.reserve_at(&alice, Resource::ComputeSeconds, amount, now)
            else {
                continue;
            };
            if commit {
                expected_committed += amount;
                ledger.commit(reservation);
            } else {
                ledger.rollback(reservation);
            }
        }

        let summary = ledger.usage_summary_at(&alice, now);
        let usage = &summary.usage["compute_seconds"];
        prop_assert_eq!(usage.used, expected_committed);
        prop_assert_eq!(usage.reserved, 0u64);
    }
}

// =============================================================================
// Contention: shared state under concurrent callers
// =============================================================================

#[tokio::test]
async fn contention_breaker_admits_exactly_one_probe() {
    let breaker = Arc::new(CircuitBreaker::new(
        "probe-race",
        CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        },
    ));

    // Trip the breaker, then wait out the recovery timeout
    let _: Result<(), GateError> = breaker
        .execute(|| async { Err(GateError::Backend(BackendError::Transient("x".into()))) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // 32 concurrent callers race for the half-open slot
    let probes = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..32 {
        let breaker = breaker.clone();
        let probes = probes.clone();
        handles.push(tokio::spawn(async move {
            breaker
                .execute(|| async {
                    probes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, GateError>(())
                })
                .await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(GateError::CircuitOpen { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // Only the probe winner ran while the circuit was half-open
    assert_eq!(probes.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 31);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn contention_limiter_exact_under_parallel_same_key_traffic() {
    let limiter = Arc::new(SlidingWindowLimiter::new());
    let now = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let limiter = limiter.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut admitted = 0u32;
            for _ in 0..50 {
                if limiter
                    .check_at("alice", "/translate", 100, Duration::from_secs(60), now)
                    .allowed
                {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0u32;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // 800 attempts against a limit of 100: exactly 100 admitted
    assert_eq!(total, 100);
}

#[tokio::test]
async fn contention_quota_atomic_under_parallel_reserves() {
    let ledger = Arc::new(QuotaLedger::new(1.0));
    let alice = Principal::new("alice", Tier::Free); // 1000 requests/day

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let alice = alice.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut committed = 0u64;
            for _ in 0..200 {
                if let Ok(reservation) = ledger.reserve(&alice, Resource::Requests, 1) {
                    ledger.commit(reservation);
                    committed += 1;
                }
            }
            committed
        }));
    }

    let mut total = 0u64;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // 1600 attempts against a cap of 1000: exactly the cap commits
    assert_eq!(total, 1_000);
    let summary = ledger.usage_summary(&alice);
    assert_eq!(summary.usage["requests"].used, 1_000);
    assert_eq!(summary.usage["requests"].remaining, 0);
}

#[tokio::test]
async fn contention_pool_bound_holds_under_burst() {
    let pool = Arc::new(WorkerPool::new(3, 64));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..40 {
        let pool = pool.clone();
        let active = active.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            pool.run(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, GateError>(())
            })
            .await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            completed += 1;
        }
    }

    assert_eq!(completed, 40, "everything admitted should finish");
    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "worker bound exceeded: {}",
        peak.load(Ordering::SeqCst)
    );
}
