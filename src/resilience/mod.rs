// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-isolation building blocks: retry with backoff, circuit breakers.

pub mod circuit_breaker;
pub mod retry;
