// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daily usage quotas with reserve/commit/rollback settlement.
//!
//! Usage is reserved at admission and only committed after the backend call
//! succeeds, so a user is never charged for a system-side failure. Counters
//! are bucketed by UTC day and roll over lazily: the first touch after
//! midnight resets the bucket, independent of request arrival order.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::principal::{Principal, Resource, Tier};

/// Per-resource counter for one UTC day.
struct DayCounter {
    day: NaiveDate,
    committed: u64,
    reserved: u64,
    warned: bool,
}

impl DayCounter {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            day,
            committed: 0,
            reserved: 0,
            warned: false,
        }
    }

    fn in_flight_total(&self) -> u64 {
        self.committed + self.reserved
    }
}

/// A pending usage charge. Settle exactly once with
/// [`QuotaLedger::commit`] or [`QuotaLedger::rollback`].
#[derive(Debug)]
#[must_use = "reservations must be committed or rolled back"]
pub struct Reservation {
    principal_id: String,
    resource: Resource,
    amount: u64,
    day: NaiveDate,
}

impl Reservation {
    #[must_use]
    pub fn resource(&self) -> Resource {
        self.resource
    }

    #[must_use]
    pub fn amount(&self) -> u64 {
        self.amount
    }
}

/// Fired once per resource per day when usage crosses the warning fraction.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaWarning {
    pub principal_id: String,
    pub resource: Resource,
    pub used: u64,
    pub limit: u64,
}

/// Hook invoked on quota warnings. Must not block: it runs inline on the
/// admission path.
pub type WarningHook = Arc<dyn Fn(&QuotaWarning) + Send + Sync>;

/// Per-resource usage for one principal, for the usage API surface.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub principal_id: String,
    pub tier: Tier,
    pub day: NaiveDate,
    /// resource name -> (used, limit)
    pub usage: HashMap<String, ResourceUsage>,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub used: u64,
    pub reserved: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Daily quota accounting, shared across all request handlers.
pub struct QuotaLedger {
    counters: DashMap<(String, Resource), DayCounter>,
    warn_fraction: f64,
    warning_hook: Option<WarningHook>,
}

impl QuotaLedger {
    #[must_use]
    pub fn new(warn_fraction: f64) -> Self {
        Self {
            counters: DashMap::new(),
            warn_fraction: warn_fraction.clamp(0.0, 1.0),
            warning_hook: None,
        }
    }

    /// Install a hook fired when a principal first crosses the warning
    /// fraction of a daily cap.
    pub fn with_warning_hook(mut self, hook: WarningHook) -> Self {
        self.warning_hook = Some(hook);
        self
    }

    /// Reserve `amount` units of `resource` against today's cap.
    ///
    /// Reserved usage counts toward the cap immediately, bounding
    /// concurrent abuse, but becomes a charge only on [`commit`](Self::commit).
    pub fn reserve(
        &self,
        principal: &Principal,
        resource: Resource,
        amount: u64,
    ) -> Result<Reservation, GateError> {
        self.reserve_at(principal, resource, amount, Utc::now())
    }

    pub fn reserve_at(
        &self,
        principal: &Principal,
        resource: Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, GateError> {
        let limit = principal.tier.limits().daily_cap(resource);
        let day = now.date_naive();

        let key = (principal.id.clone(), resource);
        let mut counter = self
            .counters
            .entry(key)
            .or_insert_with(|| DayCounter::fresh(day));
        Self::roll_over(&mut counter, day);

        if counter.in_flight_total() + amount > limit {
            debug!(
                principal = %principal.id,
                resource = %resource,
                used = counter.committed,
                reserved = counter.reserved,
                limit,
                "Daily quota exceeded"
            );
            return Err(GateError::QuotaExceeded {
                resource,
                reset_at: next_utc_midnight(now),
            });
        }

        counter.reserved += amount;

        if !counter.warned
            && counter.in_flight_total() as f64 >= self.warn_fraction * limit as f64
        {
            counter.warned = true;
            let warning = QuotaWarning {
                principal_id: principal.id.clone(),
                resource,
                used: counter.in_flight_total(),
                limit,
            };
            drop(counter);
            warn!(
                principal = %warning.principal_id,
                resource = %warning.resource,
                used = warning.used,
                limit = warning.limit,
                "Principal approaching daily quota"
            );
            crate::metrics::record_quota_warning(&warning.resource.to_string());
            if let Some(hook) = &self.warning_hook {
                hook(&warning);
            }
        }

        Ok(Reservation {
            principal_id: principal.id.clone(),
            resource,
            amount,
            day,
        })
    }

    /// Convert a reservation into committed usage.
    ///
    /// If the UTC day rolled over between reserve and commit, the charge is
    /// dropped against the fresh counter rather than double-charged.
    pub fn commit(&self, reservation: Reservation) {
        self.settle(reservation, true);
    }

    /// Release a reservation without charging it.
    pub fn rollback(&self, reservation: Reservation) {
        self.settle(reservation, false);
    }

    fn settle(&self, reservation: Reservation, charge: bool) {
        let key = (reservation.principal_id.clone(), reservation.resource);
        let Some(mut counter) = self.counters.get_mut(&key) else {
            return;
        };
        if counter.day != reservation.day {
            // Rolled over mid-flight: the reservation belongs to a day
            // whose bucket no longer exists.
            info!(
                principal = %reservation.principal_id,
                resource = %reservation.resource,
                "Reservation settled across a day boundary, dropped"
            );
            return;
        }
        counter.reserved = counter.reserved.saturating_sub(reservation.amount);
        if charge {
            counter.committed += reservation.amount;
        }
    }

    /// Current usage across all resources for one principal.
    #[must_use]
    pub fn usage_summary(&self, principal: &Principal) -> UsageSummary {
        self.usage_summary_at(principal, Utc::now())
    }

    pub fn usage_summary_at(&self, principal: &Principal, now: DateTime<Utc>) -> UsageSummary {
        let limits = principal.tier.limits();
        let day = now.date_naive();
        let mut usage = HashMap::new();

        for resource in Resource::ALL {
            let limit = limits.daily_cap(resource);
            let (committed, reserved) = self
                .counters
                .get(&(principal.id.clone(), resource))
                .filter(|c| c.day == day)
                .map(|c| (c.committed, c.reserved))
                .unwrap_or((0, 0));
            usage.insert(
                resource.to_string(),
                ResourceUsage {
                    used: committed,
                    reserved,
                    limit,
                    remaining: limit.saturating_sub(committed + reserved),
                },
            );
        }

        UsageSummary {
            principal_id: principal.id.clone(),
            tier: principal.tier,
            day,
            usage,
            reset_at: next_utc_midnight(now),
        }
    }

    /// Drop counters from previous days. Maintenance-task helper.
    pub fn prune(&self) -> usize {
        let today = Utc::now().date_naive();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.day == today);
        before - self.counters.len()
    }

    fn roll_over(counter: &mut DayCounter, day: NaiveDate) {
        if counter.day != day {
            *counter = DayCounter::fresh(day);
        }
    }
}

/// Start of the next UTC day.
pub(crate) fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    Utc.with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}
