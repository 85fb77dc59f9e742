//! Hourly per-tenant rate windows.
//!
//! Counters are keyed by `(tenant_id, change_type, window_start)` with the
//! window truncated to the hour. The check-and-increment is one atomic
//! operation, so concurrent workers can never overshoot a limit.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use safeexec_core::{ChangeType, TenantId};

use crate::store::StoreError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRateTracker;
pub use postgres::PostgresRateTracker;

/// Result of a rate window check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateCheck {
    pub allowed: bool,
    /// Count in the window after this call (including the increment, if one happened).
    pub current_count: u32,
    /// `None` = unlimited
    pub limit: Option<u32>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl RateCheck {
    /// Fraction of the limit used, `None` when unlimited.
    pub fn utilization(&self) -> Option<f64> {
        match self.limit {
            Some(0) => Some(1.0),
            Some(limit) => Some(f64::from(self.current_count) / f64::from(limit)),
            None => None,
        }
    }
}

/// `[start, end)` of the hour window containing `now`.
pub fn hour_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
    (start, start + Duration::hours(1))
}

pub(crate) fn within_limit(count: u32, limit: Option<u32>) -> bool {
    limit.is_none_or(|l| count < l)
}

#[async_trait]
pub trait RateTracker: Send + Sync {
    /// Check the window containing `now` against `limit`.
    ///
    /// With `increment`, the counter is bumped only if the check passes, in the
    /// same atomic step. Unlimited types are always allowed and still counted.
    async fn check_and_maybe_increment(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
        now: DateTime<Utc>,
        limit: Option<u32>,
        increment: bool,
    ) -> Result<RateCheck, StoreError>;

    /// Drop windows that ended before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
