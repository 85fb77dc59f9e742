//! Append-only audit log of change request transitions.
//!
//! Records are never updated. Velocity state is derived from the log on
//! read rather than kept as a mutable counter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use safeexec_core::{ChangeRequestId, ChangeStatus, ChangeType, HistoryRecord, TenantId};

use crate::store::StoreError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryHistoryLog;
pub use postgres::PostgresHistoryLog;

/// Filter for entity-level history reads.
#[derive(Debug, Clone)]
pub struct EntityHistoryQuery {
    pub tenant_id: TenantId,
    pub target_entity_id: String,
    pub change_type: Option<ChangeType>,
    pub since: DateTime<Utc>,
    pub limit: usize,
}

#[async_trait]
pub trait HistoryLog: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Append several records in order, as one write where the backend allows it.
    async fn append_batch(&self, records: Vec<HistoryRecord>) -> Result<(), StoreError> {
        for record in records {
            self.append(record).await?;
        }
        Ok(())
    }

    /// Sum of `|change_percentage|` over completed changes to one entity
    /// recorded at or after `since`.
    async fn velocity_sum(
        &self,
        tenant_id: TenantId,
        target_entity_id: &str,
        change_type: ChangeType,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError>;

    /// All records for one request, oldest first.
    async fn list_for_request(&self, request_id: ChangeRequestId) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Records for one entity, newest first.
    async fn list_for_entity(&self, query: EntityHistoryQuery) -> Result<Vec<HistoryRecord>, StoreError>;

    /// `failed` and `blocked` records at or after `since`, newest first.
    async fn list_failures(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

pub(crate) fn is_failure(status: ChangeStatus) -> bool {
    matches!(status, ChangeStatus::Failed | ChangeStatus::Blocked)
}
