//! Exclusive work claiming.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use safeexec_core::{ChangeRequest, HistoryRecord, WorkerId};

use crate::history::HistoryLog;
use crate::store::{ChangeRequestStore, StoreError};

/// Hands out eligible requests to workers, at most one owner per request.
pub struct ClaimCoordinator {
    store: Arc<dyn ChangeRequestStore>,
    history: Arc<dyn HistoryLog>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn ChangeRequestStore>, history: Arc<dyn HistoryLog>) -> Self {
        Self { store, history }
    }

    pub async fn claim_one(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ChangeRequest>, StoreError> {
        Ok(self.claim_batch(worker_id, now, 1).await?.into_iter().next())
    }

    /// Claim up to `batch_size` eligible requests, oldest eligibility first.
    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    pub async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.store.claim_batch(worker_id, now, batch_size).await?;
        if claimed.is_empty() {
            return Ok(claimed);
        }

        let records = claimed.iter().map(|r| HistoryRecord::snapshot(r, now)).collect();
        self.history.append_batch(records).await?;

        debug!(count = claimed.len(), "claimed change requests");
        Ok(claimed)
    }

    /// Return claims older than `claim_timeout` to the queue.
    pub async fn reclaim_abandoned(
        &self,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let timeout = chrono::Duration::from_std(claim_timeout).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let released = self.store.reclaim_stale(now - timeout, now).await?;
        if released.is_empty() {
            return Ok(released);
        }

        for request in &released {
            warn!(
                request_id = %request.id,
                entity_id = %request.target_entity_id,
                reason = request.error_message.as_deref().unwrap_or_default(),
                "abandoned claim returned to queue"
            );
        }
        let records = released.iter().map(|r| HistoryRecord::snapshot(r, now)).collect();
        self.history.append_batch(records).await?;

        info!(count = released.len(), "reclaimed abandoned claims");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use safeexec_core::{ChangeStatus, NewChangeRequest, TenantId};

    use super::*;
    use crate::history::InMemoryHistoryLog;
    use crate::store::InMemoryChangeRequestStore;

    async fn setup(n: usize) -> (ClaimCoordinator, Arc<InMemoryChangeRequestStore>, Arc<InMemoryHistoryLog>) {
        let store = Arc::new(InMemoryChangeRequestStore::new());
        let history = Arc::new(InMemoryHistoryLog::new());
        let tenant = TenantId::new();
        let now = Utc::now();
        for i in 0..n {
            let req = ChangeRequest::from_new(
                NewChangeRequest::budget(tenant, format!("c-{i}"), 100.0, 110.0, 0.9)
                    .execute_at(now - chrono::Duration::seconds(60 - i as i64)),
                0,
                now,
            )
            .unwrap();
            store.insert(req).await.unwrap();
        }
        (ClaimCoordinator::new(store.clone(), history.clone()), store, history)
    }

    #[tokio::test]
    async fn claims_are_recorded_in_history() {
        let (coordinator, _, history) = setup(3).await;
        let worker = WorkerId::new("w-1");

        let claimed = coordinator.claim_batch(&worker, Utc::now(), 2).await.unwrap();
        assert_eq!(claimed.len(), 2);

        let records = history.all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == ChangeStatus::Claimed));
        assert!(records.iter().all(|r| r.worker_id.as_ref() == Some(&worker)));
    }

    #[tokio::test]
    async fn claim_one_returns_none_when_queue_is_empty() {
        let (coordinator, _, history) = setup(1).await;
        let worker = WorkerId::new("w-1");

        assert!(coordinator.claim_one(&worker, Utc::now()).await.unwrap().is_some());
        assert!(coordinator.claim_one(&worker, Utc::now()).await.unwrap().is_none());
        assert_eq!(history.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_claims_become_claimable_again() {
        let (coordinator, store, _) = setup(1).await;
        let now = Utc::now();
        let claimed = coordinator.claim_one(&WorkerId::new("crashed"), now).await.unwrap().unwrap();

        let later = now + chrono::Duration::minutes(6);
        let released = coordinator.reclaim_abandoned(later, Duration::from_secs(300)).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(store.get(claimed.id).await.unwrap().unwrap().status, ChangeStatus::Pending);

        let reclaimed = coordinator.claim_one(&WorkerId::new("survivor"), later).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.claimed_by, Some(WorkerId::new("survivor")));
    }
}
