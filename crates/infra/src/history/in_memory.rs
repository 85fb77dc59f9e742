//! In-memory history log for tests/dev.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use safeexec_core::{ChangeRequestId, ChangeStatus, ChangeType, HistoryRecord, TenantId};

use super::{EntityHistoryQuery, HistoryLog, is_failure};
use crate::store::StoreError;

/// Vector-backed log; insertion order is append order.
#[derive(Debug, Default)]
pub struct InMemoryHistoryLog {
    records: Mutex<Vec<HistoryRecord>>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<HistoryRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Storage("history log lock poisoned".to_string()))
    }

    /// Every record, in append order.
    pub fn all(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self.lock()?.clone())
    }
}

#[async_trait]
impl HistoryLog for InMemoryHistoryLog {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.lock()?.push(record);
        Ok(())
    }

    async fn append_batch(&self, records: Vec<HistoryRecord>) -> Result<(), StoreError> {
        self.lock()?.extend(records);
        Ok(())
    }

    async fn velocity_sum(
        &self,
        tenant_id: TenantId,
        target_entity_id: &str,
        change_type: ChangeType,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| {
                r.status == ChangeStatus::Completed
                    && r.tenant_id == tenant_id
                    && r.target_entity_id == target_entity_id
                    && r.change_type == change_type
                    && r.recorded_at >= since
            })
            .filter_map(|r| r.change_percentage)
            .map(f64::abs)
            .sum())
    }

    async fn list_for_request(&self, request_id: ChangeRequestId) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn list_for_entity(&self, query: EntityHistoryQuery) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .rev()
            .filter(|r| {
                r.tenant_id == query.tenant_id
                    && r.target_entity_id == query.target_entity_id
                    && query.change_type.is_none_or(|t| t == r.change_type)
                    && r.recorded_at >= query.since
            })
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn list_failures(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .rev()
            .filter(|r| {
                is_failure(r.status)
                    && r.recorded_at >= since
                    && tenant_id.is_none_or(|t| t == r.tenant_id)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
