//! In-memory change request store for tests/dev.
//!
//! Each operation runs inside one short critical section, so a batch claim
//! is indivisible: no other caller can observe (or wait on) a half-claimed row.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use safeexec_core::{
    ChangeRequest, ChangeRequestId, ChangeStatus, ChangeType, TenantId, Transition, WorkerId,
};

use super::{ChangeRequestStore, QueueDepth, StoreError, abandoned_message};

#[derive(Debug, Default)]
struct Inner {
    requests: HashMap<ChangeRequestId, ChangeRequest>,
    next_sequence: u64,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct InMemoryChangeRequestStore {
    inner: Mutex<Inner>,
}

impl InMemoryChangeRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("change request store lock poisoned".to_string()))
    }
}

fn eligible_sorted(inner: &Inner, now: DateTime<Utc>) -> Vec<ChangeRequestId> {
    let mut eligible: Vec<&ChangeRequest> = inner
        .requests
        .values()
        .filter(|r| r.is_eligible(now))
        .collect();
    eligible.sort_by_key(|r| (r.earliest_execute_at, r.sequence));
    eligible.into_iter().map(|r| r.id).collect()
}

#[async_trait]
impl ChangeRequestStore for InMemoryChangeRequestStore {
    async fn insert(&self, mut request: ChangeRequest) -> Result<ChangeRequest, StoreError> {
        let mut inner = self.lock()?;
        if inner.requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        inner.next_sequence += 1;
        request.sequence = inner.next_sequence;
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: ChangeRequestId) -> Result<Option<ChangeRequest>, StoreError> {
        Ok(self.lock()?.requests.get(&id).cloned())
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let inner = self.lock()?;
        Ok(eligible_sorted(&inner, now)
            .into_iter()
            .take(limit)
            .filter_map(|id| inner.requests.get(&id).cloned())
            .collect())
    }

    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let mut inner = self.lock()?;
        let selected: Vec<ChangeRequestId> =
            eligible_sorted(&inner, now).into_iter().take(batch_size).collect();

        let claim = Transition::claim(worker_id.clone(), now);
        let mut claimed = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(request) = inner.requests.get_mut(&id) {
                request.apply(&claim)?;
                claimed.push(request.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: ChangeRequestId,
        transition: &Transition,
    ) -> Result<ChangeRequest, StoreError> {
        let mut inner = self.lock()?;
        let request = inner.requests.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Apply to a copy so a refused transition leaves the stored row untouched.
        let mut updated = request.clone();
        updated.apply(transition)?;
        *request = updated.clone();
        Ok(updated)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let mut inner = self.lock()?;
        let mut released = Vec::new();
        for request in inner.requests.values_mut() {
            let stale = request.status == ChangeStatus::Claimed
                && request.claimed_at.is_some_and(|at| at < claimed_before);
            if !stale {
                continue;
            }
            let release = Transition::release(now, abandoned_message(request.claimed_by.as_ref()));
            request.apply(&release)?;
            released.push(request.clone());
        }
        released.sort_by_key(|r| r.sequence);
        Ok(released)
    }

    async fn find_overdue(
        &self,
        change_type: ChangeType,
        created_before: DateTime<Utc>,
        stale_claim_before: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let inner = self.lock()?;
        let mut overdue: Vec<ChangeRequest> = inner
            .requests
            .values()
            .filter(|r| r.change_type == change_type && r.created_at < created_before)
            .filter(|r| match r.status {
                ChangeStatus::Pending => true,
                ChangeStatus::Claimed | ChangeStatus::Executing => {
                    r.claimed_at.is_some_and(|at| at < stale_claim_before)
                }
                _ => false,
            })
            .cloned()
            .collect();
        overdue.sort_by_key(|r| r.sequence);
        Ok(overdue)
    }

    async fn count_by_status(&self, tenant_id: Option<TenantId>) -> Result<QueueDepth, StoreError> {
        let inner = self.lock()?;
        let mut depth = QueueDepth::default();
        for request in inner.requests.values() {
            if tenant_id.is_none_or(|t| t == request.tenant_id) {
                depth.add(request.status, 1);
            }
        }
        Ok(depth)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.requests.len();
        inner
            .requests
            .retain(|_, r| !(r.status.is_terminal() && r.updated_at < cutoff));
        Ok((before - inner.requests.len()) as u64)
    }
}
