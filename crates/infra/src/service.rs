//! Upstream-facing entry point: enqueue, inspect, cancel.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use safeexec_core::{
    BlockReason, ChangeRequest, ChangeRequestId, ChangeStatus, Clock, DomainError, FailureKind,
    HistoryRecord, NewChangeRequest, PolicyBook, Transition,
};

use crate::history::HistoryLog;
use crate::safety::SafetyEngine;
use crate::store::{ChangeRequestStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// Rejected synchronously; nothing was persisted.
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("change request not found: {0}")]
    NotFound(ChangeRequestId),
    #[error("change request {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: ChangeRequestId, status: ChangeStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acknowledgement returned to the submitting agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueueReceipt {
    pub id: ChangeRequestId,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockReason>,
}

pub struct SafeExecutor {
    store: Arc<dyn ChangeRequestStore>,
    history: Arc<dyn HistoryLog>,
    safety: Arc<SafetyEngine>,
    policies: PolicyBook,
    clock: Arc<dyn Clock>,
}

impl SafeExecutor {
    pub fn new(
        store: Arc<dyn ChangeRequestStore>,
        history: Arc<dyn HistoryLog>,
        safety: Arc<SafetyEngine>,
        policies: PolicyBook,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            history,
            safety,
            policies,
            clock,
        }
    }

    /// Validate, screen, and persist a new change request.
    ///
    /// A request that fails a safety rule is still persisted, already
    /// `blocked`, so the decision is auditable. It is never visible as
    /// `pending` to a worker.
    #[instrument(
        skip(self, new),
        fields(tenant_id = %new.tenant_id, entity_id = %new.target_entity_id, change_type = %new.change_type),
        err
    )]
    pub async fn enqueue(&self, new: NewChangeRequest) -> Result<EnqueueReceipt, EnqueueError> {
        let now = self.clock.now();
        let priority = self.policies.get(new.change_type).default_priority;
        let mut request = ChangeRequest::from_new(new, priority, now)?;

        let decision = self.safety.evaluate(&request, now).await?;
        let Some(reason) = decision.blocked_reason() else {
            let request = self.store.insert(request).await?;
            self.history.append(HistoryRecord::snapshot(&request, now)).await?;
            info!(
                request_id = %request.id,
                earliest_execute_at = %request.earliest_execute_at,
                "change request enqueued"
            );
            return Ok(EnqueueReceipt {
                id: request.id,
                status: request.status,
                blocked_reason: None,
            });
        };

        let message = decision.error_message().unwrap_or_else(|| reason.to_string());
        request
            .apply(&Transition::block(ChangeStatus::Pending, now, message.clone()))
            .map_err(StoreError::from)?;
        let blocked = self.store.insert(request).await?;
        self.history
            .append(HistoryRecord::snapshot(&blocked, now).with_safety(decision.result))
            .await?;
        warn!(
            request_id = %blocked.id,
            failure_kind = ?FailureKind::SafetyBlocked,
            reason = %reason,
            error = %message,
            "change request blocked at enqueue"
        );
        Ok(EnqueueReceipt {
            id: blocked.id,
            status: blocked.status,
            blocked_reason: Some(reason),
        })
    }

    pub async fn get(&self, id: ChangeRequestId) -> Result<ChangeRequest, ServiceError> {
        self.store.get(id).await?.ok_or(ServiceError::NotFound(id))
    }

    /// Withdraw a request that no worker has claimed yet.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: ChangeRequestId) -> Result<ChangeRequest, ServiceError> {
        let current = self.get(id).await?;
        if current.status != ChangeStatus::Pending {
            return Err(ServiceError::NotCancellable {
                id,
                status: current.status,
            });
        }

        let now = self.clock.now();
        let cancelled = match self.store.transition(id, &Transition::cancel(now)).await {
            Ok(request) => request,
            Err(StoreError::Conflict(_)) => {
                // A worker claimed it in between.
                let status = self.get(id).await?.status;
                return Err(ServiceError::NotCancellable { id, status });
            }
            Err(e) => return Err(e.into()),
        };
        self.history.append(HistoryRecord::snapshot(&cancelled, now)).await?;

        info!(request_id = %id, "change request cancelled");
        Ok(cancelled)
    }

    /// Full audit trail of one request, oldest first.
    pub async fn history(&self, id: ChangeRequestId) -> Result<Vec<HistoryRecord>, ServiceError> {
        let records = self.history.list_for_request(id).await?;
        if records.is_empty() && self.store.get(id).await?.is_none() {
            return Err(ServiceError::NotFound(id));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use safeexec_core::{ChangeType, ManualClock, NewChangeRequest, TenantId, WorkerId};

    use super::*;
    use crate::store::{InMemoryChangeRequestStore, QueueDepth};
    use crate::test_support::Harness;

    #[tokio::test]
    async fn enqueue_persists_pending_request_with_history() {
        let h = Harness::new();
        let receipt = h.executor.enqueue(h.budget("c-1", 100.0, 120.0)).await.unwrap();

        assert_eq!(receipt.status, ChangeStatus::Pending);
        assert_eq!(receipt.blocked_reason, None);
        let request = h.get(receipt.id).await;
        assert_eq!(request.priority, 100);
        assert_eq!(h.trail(receipt.id), vec![ChangeStatus::Pending]);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected_without_persisting() {
        let h = Harness::new();
        let err = h
            .executor
            .enqueue(NewChangeRequest::budget(h.tenant, "c-1", 100.0, 100.0, 0.9))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Invalid(_)));
        assert!(h.history.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_confidence_is_blocked_at_enqueue() {
        let h = Harness::new();
        let receipt = h
            .executor
            .enqueue(NewChangeRequest::budget(h.tenant, "c-1", 100.0, 120.0, 0.5))
            .await
            .unwrap();

        assert_eq!(receipt.status, ChangeStatus::Blocked);
        assert_eq!(receipt.blocked_reason, Some(BlockReason::LowConfidence));
        assert_eq!(h.status(receipt.id).await, ChangeStatus::Blocked);

        let trail = h.executor.history(receipt.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].status, ChangeStatus::Blocked);
        assert_eq!(trail[0].blocked_reason(), Some(BlockReason::LowConfidence));
    }

    /// Store whose worker claims everything eligible the moment it is inserted.
    struct EagerWorkerStore {
        inner: Arc<InMemoryChangeRequestStore>,
        worker: WorkerId,
        clock: ManualClock,
    }

    #[async_trait]
    impl ChangeRequestStore for EagerWorkerStore {
        async fn insert(&self, request: ChangeRequest) -> Result<ChangeRequest, StoreError> {
            let inserted = self.inner.insert(request).await?;
            self.inner.claim_batch(&self.worker, self.clock.now(), 10).await?;
            Ok(inserted)
        }

        async fn get(&self, id: ChangeRequestId) -> Result<Option<ChangeRequest>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ChangeRequest>, StoreError> {
            self.inner.list_eligible(now, limit).await
        }

        async fn claim_batch(
            &self,
            worker_id: &WorkerId,
            now: DateTime<Utc>,
            batch_size: usize,
        ) -> Result<Vec<ChangeRequest>, StoreError> {
            self.inner.claim_batch(worker_id, now, batch_size).await
        }

        async fn transition(&self, id: ChangeRequestId, transition: &Transition) -> Result<ChangeRequest, StoreError> {
            self.inner.transition(id, transition).await
        }

        async fn reclaim_stale(
            &self,
            claimed_before: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Vec<ChangeRequest>, StoreError> {
            self.inner.reclaim_stale(claimed_before, now).await
        }

        async fn find_overdue(
            &self,
            change_type: ChangeType,
            created_before: DateTime<Utc>,
            stale_claim_before: DateTime<Utc>,
        ) -> Result<Vec<ChangeRequest>, StoreError> {
            self.inner.find_overdue(change_type, created_before, stale_claim_before).await
        }

        async fn count_by_status(&self, tenant_id: Option<TenantId>) -> Result<QueueDepth, StoreError> {
            self.inner.count_by_status(tenant_id).await
        }

        async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_terminal_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn blocked_requests_are_never_claimable() {
        let h = Harness::new();
        let store = Arc::new(EagerWorkerStore {
            inner: h.store.clone(),
            worker: WorkerId::new("eager"),
            clock: h.clock.clone(),
        });
        let executor = SafeExecutor::new(
            store,
            h.history.clone(),
            h.safety.clone(),
            h.policies.clone(),
            Arc::new(h.clock.clone()),
        );

        let receipt = executor
            .enqueue(NewChangeRequest::budget(h.tenant, "c-1", 100.0, 120.0, 0.1))
            .await
            .unwrap();
        assert_eq!(receipt.status, ChangeStatus::Blocked);
        assert_eq!(receipt.blocked_reason, Some(BlockReason::LowConfidence));

        let request = h.get(receipt.id).await;
        assert_eq!(request.status, ChangeStatus::Blocked);
        assert!(request.claimed_by.is_none());
        assert_eq!(h.trail(receipt.id), vec![ChangeStatus::Blocked]);

        // A passing request is still claimed by the same eager worker.
        let ok = executor.enqueue(h.budget("c-2", 100.0, 110.0)).await.unwrap();
        assert_eq!(ok.status, ChangeStatus::Pending);
        assert_eq!(h.status(ok.id).await, ChangeStatus::Claimed);
    }

    #[tokio::test]
    async fn override_skips_confidence() {
        let h = Harness::new();
        let receipt = h
            .executor
            .enqueue(NewChangeRequest::budget(h.tenant, "c-1", 100.0, 120.0, 0.1).with_override())
            .await
            .unwrap();
        assert_eq!(receipt.status, ChangeStatus::Pending);
    }

    #[tokio::test]
    async fn only_pending_requests_can_be_cancelled() {
        let h = Harness::new();
        let pending = h.enqueue(h.budget("c-1", 100.0, 120.0)).await;
        let cancelled = h.executor.cancel(pending).await.unwrap();
        assert_eq!(cancelled.status, ChangeStatus::Cancelled);

        let claimed = h.enqueue(h.budget("c-2", 100.0, 120.0)).await;
        h.coordinator
            .claim_one(&WorkerId::new("w-1"), h.clock.now())
            .await
            .unwrap();
        let err = h.executor.cancel(claimed).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::NotCancellable {
                status: ChangeStatus::Claimed,
                ..
            }
        ));

        let err = h.executor.cancel(pending).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn history_of_unknown_request_is_not_found() {
        let h = Harness::new();
        let err = h.executor.history(ChangeRequestId::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
