// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Admission control: sliding-window rate limiting, daily quota accounting,
//! and the [`RequestGate`] that composes them into one decision.

pub mod gate;
pub mod quota;
pub mod rate_limiter;

pub use gate::{Admission, RequestGate, ResourceEstimate};
pub use quota::{QuotaLedger, Reservation, UsageSummary};
pub use rate_limiter::{RateDecision, SlidingWindowLimiter};
