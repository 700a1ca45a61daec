// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the inference gate.
//!
//! Uses the `metrics` crate for backend-agnostic collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `inference_gate_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: translate, transcribe, pipeline, batch
//! - `outcome`: success, error, rejected, hit, miss
//! - `circuit`: dependency name (translation, transcription)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a request-path outcome
pub fn record_request(operation: &str, outcome: &str) {
    counter!(
        "inference_gate_requests_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an admission rejection by reason code
pub fn record_rejection(reason: &str) {
    counter!(
        "inference_gate_rejections_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record end-to-end operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "inference_gate_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache lookup outcome
pub fn record_cache(outcome: &str) {
    counter!(
        "inference_gate_cache_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a cache-store failure (degraded to pass-through)
pub fn record_cache_store_error(operation: &str) {
    counter!(
        "inference_gate_cache_store_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "inference_gate_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state (0 = closed, 1 = half_open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "inference_gate_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(
        "inference_gate_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a backend call outcome
pub fn record_backend_call(backend: &str, outcome: &str) {
    counter!(
        "inference_gate_backend_calls_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a quota warning (principal crossed the warn fraction)
pub fn record_quota_warning(resource: &str) {
    counter!(
        "inference_gate_quota_warnings_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Set current worker pool occupancy
pub fn set_pool_active(active: usize) {
    gauge!("inference_gate_pool_active_workers").set(active as f64);
}

/// Set current worker pool queue depth
pub fn set_pool_queued(queued: usize) {
    gauge!("inference_gate_pool_queued").set(queued as f64);
}

/// Record a pool rejection (queue bound exceeded)
pub fn record_pool_rejection() {
    counter!("inference_gate_pool_rejections_total").increment(1);
}

/// Set aggregate health status (0 = healthy, 1 = degraded, 2 = unhealthy)
pub fn set_health_status(status: u8) {
    gauge!("inference_gate_health_status").set(status as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
