//! Periodic sweeps: abandoned claims, expiry, retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use safeexec_core::{ChangeRequest, ChangeType, HistoryRecord, PolicyBook, Transition};

use crate::claim::ClaimCoordinator;
use crate::history::HistoryLog;
use crate::rate::RateTracker;
use crate::store::{ChangeRequestStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub expired: usize,
    pub purged_requests: u64,
    pub purged_history: u64,
    pub purged_rate_windows: u64,
}

pub struct Maintenance {
    store: Arc<dyn ChangeRequestStore>,
    history: Arc<dyn HistoryLog>,
    rates: Arc<dyn RateTracker>,
    coordinator: Arc<ClaimCoordinator>,
    policies: PolicyBook,
    claim_timeout: Duration,
    retention: Duration,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn ChangeRequestStore>,
        history: Arc<dyn HistoryLog>,
        rates: Arc<dyn RateTracker>,
        coordinator: Arc<ClaimCoordinator>,
        policies: PolicyBook,
        claim_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            history,
            rates,
            coordinator,
            policies,
            claim_timeout,
            retention,
        }
    }

    /// Run every sweep once.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, StoreError> {
        let reclaimed = self.coordinator.reclaim_abandoned(now, self.claim_timeout).await?.len();
        let expired = self.expire_overdue(now).await?.len();
        let (purged_requests, purged_history, purged_rate_windows) = self.purge_retention(now).await?;

        let report = MaintenanceReport {
            reclaimed,
            expired,
            purged_requests,
            purged_history,
            purged_rate_windows,
        };
        if report != MaintenanceReport::default() {
            info!(?report, "maintenance sweep");
        }
        Ok(report)
    }

    /// Expire requests that outlived their change type's time budget.
    ///
    /// Requests actively held by a live worker are left to that worker.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ChangeRequest>, StoreError> {
        let stale_claim_before = before(now, self.claim_timeout);
        let mut expired = Vec::new();

        for change_type in ChangeType::ALL {
            let policy = self.policies.get(change_type);
            let created_before = before(now, Duration::from_secs(policy.expire_in_seconds));
            let overdue = self
                .store
                .find_overdue(change_type, created_before, stale_claim_before)
                .await?;

            for request in overdue {
                let message = format!("expired: not completed within {}s of creation", policy.expire_in_seconds);
                match self
                    .store
                    .transition(request.id, &Transition::expire(request.status, now, message))
                    .await
                {
                    Ok(updated) => {
                        self.history.append(HistoryRecord::snapshot(&updated, now)).await?;
                        info!(request_id = %updated.id, change_type = %change_type, "change request expired");
                        expired.push(updated);
                    }
                    Err(StoreError::Conflict(_)) => {
                        debug!(request_id = %request.id, "request moved before expiry, skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(expired)
    }

    /// Purge terminal requests, history, and rate windows older than the retention period.
    pub async fn purge_retention(&self, now: DateTime<Utc>) -> Result<(u64, u64, u64), StoreError> {
        let cutoff = before(now, self.retention);
        let requests = self.store.purge_terminal_before(cutoff).await?;
        let history = self.history.purge_before(cutoff).await?;
        let windows = self.rates.purge_before(cutoff).await?;
        Ok((requests, history, windows))
    }
}

/// `now - d`, saturating at the earliest representable instant.
fn before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
