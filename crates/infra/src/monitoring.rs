//! Read-only operator views.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use safeexec_core::{ChangeRequestId, ChangeType, Clock, HistoryRecord, PolicyBook, TenantId};

use crate::history::{EntityHistoryQuery, HistoryLog};
use crate::rate::RateTracker;
use crate::store::{ChangeRequestStore, QueueDepth, StoreError};

/// Utilization at or above this share of the limit is reported as `WARNING`.
const RATE_WARNING_PERCENT: f64 = 80.0;

const MAX_HISTORY_ROWS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitLevel {
    Ok,
    Warning,
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub tenant_id: TenantId,
    pub change_type: ChangeType,
    pub current_count: u32,
    pub limit: Option<u32>,
    pub utilization_percent: Option<f64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: RateLimitLevel,
}

pub struct Monitor {
    store: Arc<dyn ChangeRequestStore>,
    history: Arc<dyn HistoryLog>,
    rates: Arc<dyn RateTracker>,
    policies: PolicyBook,
    clock: Arc<dyn Clock>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn ChangeRequestStore>,
        history: Arc<dyn HistoryLog>,
        rates: Arc<dyn RateTracker>,
        policies: PolicyBook,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            history,
            rates,
            policies,
            clock,
        }
    }

    pub async fn queue_depth(&self, tenant_id: Option<TenantId>) -> Result<QueueDepth, StoreError> {
        self.store.count_by_status(tenant_id).await
    }

    /// Current hour's usage of a tenant's rate budget.
    pub async fn rate_limit_status(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
    ) -> Result<RateLimitStatus, StoreError> {
        let limit = self.policies.get(change_type).rate_limit_per_tenant_per_hour;
        let check = self
            .rates
            .check_and_maybe_increment(tenant_id, change_type, self.clock.now(), limit, false)
            .await?;

        let utilization_percent = check.utilization().map(|u| u * 100.0);
        let status = match (check.limit, utilization_percent) {
            (Some(limit), _) if check.current_count >= limit => RateLimitLevel::LimitReached,
            (_, Some(pct)) if pct >= RATE_WARNING_PERCENT => RateLimitLevel::Warning,
            _ => RateLimitLevel::Ok,
        };

        Ok(RateLimitStatus {
            tenant_id,
            change_type,
            current_count: check.current_count,
            limit: check.limit,
            utilization_percent,
            window_start: check.window_start,
            window_end: check.window_end,
            status,
        })
    }

    /// `failed` and `blocked` records since `since`, newest first.
    pub async fn recent_failures(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.history.list_failures(tenant_id, since, MAX_HISTORY_ROWS).await
    }

    /// Budget change records for one entity within the trailing `window`.
    pub async fn budget_change_history(
        &self,
        tenant_id: TenantId,
        target_entity_id: &str,
        window: Duration,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let now = self.clock.now();
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.history
            .list_for_entity(EntityHistoryQuery {
                tenant_id,
                target_entity_id: target_entity_id.to_string(),
                change_type: Some(ChangeType::Budget),
                since,
                limit: MAX_HISTORY_ROWS,
            })
            .await
    }

    pub async fn request_history(&self, id: ChangeRequestId) -> Result<Vec<HistoryRecord>, StoreError> {
        self.history.list_for_request(id).await
    }
}
