//! Principals, service tiers, and the explicit request context.
//!
//! A [`Principal`] is an authenticated identity carrying a [`Tier`]; the tier
//! maps to concrete rate limits, daily quotas, and payload caps via
//! [`TierLimits`]. Authentication itself happens upstream — the gate only
//! consumes the resolved identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
    Admin,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A daily-quota resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Requests,
    ComputeSeconds,
    AudioMinutes,
}

impl Resource {
    pub const ALL: [Resource; 3] = [
        Resource::Requests,
        Resource::ComputeSeconds,
        Resource::AudioMinutes,
    ];
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requests => write!(f, "requests"),
            Self::ComputeSeconds => write!(f, "compute_seconds"),
            Self::AudioMinutes => write!(f, "audio_minutes"),
        }
    }
}

/// Concrete limits for a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    /// Sliding-window admission limit
    pub requests_per_minute: u32,
    /// Daily request cap (also enforced as a quota resource)
    pub requests_per_day: u64,
    /// Daily compute-seconds cap
    pub compute_seconds_per_day: u64,
    /// Daily audio-minutes cap
    pub audio_minutes_per_day: u64,
    /// Largest accepted request payload (text bytes or raw audio bytes)
    pub max_payload_bytes: usize,
}

impl TierLimits {
    /// Daily cap for a quota resource.
    #[must_use]
    pub fn daily_cap(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Requests => self.requests_per_day,
            Resource::ComputeSeconds => self.compute_seconds_per_day,
            Resource::AudioMinutes => self.audio_minutes_per_day,
        }
    }
}

impl Tier {
    /// The built-in limit table.
    #[must_use]
    pub fn limits(&self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                requests_per_minute: 10,
                requests_per_day: 1_000,
                compute_seconds_per_day: 300,
                audio_minutes_per_day: 10,
                max_payload_bytes: 10 * 1024 * 1024,
            },
            Self::Basic => TierLimits {
                requests_per_minute: 50,
                requests_per_day: 10_000,
                compute_seconds_per_day: 3_000,
                audio_minutes_per_day: 100,
                max_payload_bytes: 25 * 1024 * 1024,
            },
            Self::Pro => TierLimits {
                requests_per_minute: 200,
                requests_per_day: 100_000,
                compute_seconds_per_day: 30_000,
                audio_minutes_per_day: 1_000,
                max_payload_bytes: 50 * 1024 * 1024,
            },
            Self::Enterprise => TierLimits {
                requests_per_minute: 1_000,
                requests_per_day: 1_000_000,
                compute_seconds_per_day: 300_000,
                audio_minutes_per_day: 10_000,
                max_payload_bytes: 100 * 1024 * 1024,
            },
            Self::Admin => TierLimits {
                requests_per_minute: 10_000,
                requests_per_day: 10_000_000,
                compute_seconds_per_day: 3_000_000,
                audio_minutes_per_day: 100_000,
                max_payload_bytes: 100 * 1024 * 1024,
            },
        }
    }
}

/// An authenticated identity with its service tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tier: Tier,
}

impl Principal {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }

    /// Identity validity check performed at the top of admission.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
    }

    #[must_use]
    pub fn limits(&self) -> TierLimits {
        self.tier.limits()
    }
}

/// Per-request context, threaded explicitly through every call.
///
/// There is no ambient/task-local request id: handlers construct a context
/// once and pass it down by value or reference.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub principal: Principal,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal,
        }
    }
}
