//! In-memory rate tracker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use safeexec_core::{ChangeType, TenantId};

use super::{RateCheck, RateTracker, hour_window, within_limit};
use crate::store::StoreError;

type WindowKey = (TenantId, ChangeType, DateTime<Utc>);

#[derive(Debug, Default)]
pub struct InMemoryRateTracker {
    counters: Mutex<HashMap<WindowKey, u32>>,
}

impl InMemoryRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<WindowKey, u32>>, StoreError> {
        self.counters
            .lock()
            .map_err(|_| StoreError::Storage("rate tracker lock poisoned".to_string()))
    }
}

#[async_trait]
impl RateTracker for InMemoryRateTracker {
    async fn check_and_maybe_increment(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
        now: DateTime<Utc>,
        limit: Option<u32>,
        increment: bool,
    ) -> Result<RateCheck, StoreError> {
        let (window_start, window_end) = hour_window(now);
        let mut counters = self.lock()?;
        let count = counters.entry((tenant_id, change_type, window_start)).or_insert(0);

        let allowed = within_limit(*count, limit);
        if allowed && increment {
            *count = count.saturating_add(1);
        }

        Ok(RateCheck {
            allowed,
            current_count: *count,
            limit,
            window_start,
            window_end,
        })
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut counters = self.lock()?;
        let before = counters.len();
        counters.retain(|(_, _, start), _| hour_window(*start).1 >= cutoff);
        Ok((before - counters.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn check_without_increment_does_not_count() {
        let tracker = InMemoryRateTracker::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..3 {
            let check = tracker
                .check_and_maybe_increment(tenant, ChangeType::Budget, now, Some(1), false)
                .await
                .unwrap();
            assert!(check.allowed);
            assert_eq!(check.current_count, 0);
        }
    }

    #[tokio::test]
    async fn new_hour_starts_a_new_window() {
        let tracker = InMemoryRateTracker::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        let first = tracker
            .check_and_maybe_increment(tenant, ChangeType::Bid, now, Some(1), true)
            .await
            .unwrap();
        assert!(first.allowed);
        let denied = tracker
            .check_and_maybe_increment(tenant, ChangeType::Bid, now, Some(1), true)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current_count, 1);

        let next_hour = tracker
            .check_and_maybe_increment(tenant, ChangeType::Bid, now + Duration::hours(1), Some(1), true)
            .await
            .unwrap();
        assert!(next_hour.allowed);
    }

    #[tokio::test]
    async fn unlimited_types_are_counted() {
        let tracker = InMemoryRateTracker::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        for _ in 0..3 {
            tracker
                .check_and_maybe_increment(tenant, ChangeType::Status, now, None, true)
                .await
                .unwrap();
        }
        let check = tracker
            .check_and_maybe_increment(tenant, ChangeType::Status, now, None, false)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_count, 3);
        assert_eq!(check.utilization(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_never_exceed_limit() {
        let tracker = Arc::new(InMemoryRateTracker::new());
        let tenant = TenantId::new();
        let now = Utc::now();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker
                    .check_and_maybe_increment(tenant, ChangeType::Budget, now, Some(5), true)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn purge_drops_ended_windows() {
        let tracker = InMemoryRateTracker::new();
        let tenant = TenantId::new();
        let now = Utc::now();
        tracker
            .check_and_maybe_increment(tenant, ChangeType::Budget, now - Duration::hours(5), None, true)
            .await
            .unwrap();
        tracker
            .check_and_maybe_increment(tenant, ChangeType::Budget, now, None, true)
            .await
            .unwrap();

        assert_eq!(tracker.purge_before(now - Duration::hours(2)).await.unwrap(), 1);
    }
}
