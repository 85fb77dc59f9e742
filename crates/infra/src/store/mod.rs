//! Change request persistence.
//!
//! The store is the single source of truth for request state. Every mutation
//! is one atomic operation: insert, batch claim, compare-and-set transition,
//! or stale-claim release. No caller holds a store lock across a platform call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use safeexec_core::{
    ChangeRequest, ChangeRequestId, ChangeStatus, ChangeType, DomainError, TenantId, Transition,
    WorkerId,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryChangeRequestStore;
pub use postgres::PostgresChangeRequestStore;

/// Storage error shared by the store, history log, and rate tracker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("change request not found: {0}")]
    NotFound(ChangeRequestId),
    #[error("change request already exists: {0}")]
    AlreadyExists(ChangeRequestId),
    /// A compare-and-set transition lost to a concurrent writer.
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => StoreError::Conflict(msg),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

/// Request counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub claimed: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    pub expired: u64,
    pub cancelled: u64,
}

impl QueueDepth {
    pub fn add(&mut self, status: ChangeStatus, count: u64) {
        let slot = match status {
            ChangeStatus::Pending => &mut self.pending,
            ChangeStatus::Claimed => &mut self.claimed,
            ChangeStatus::Executing => &mut self.executing,
            ChangeStatus::Completed => &mut self.completed,
            ChangeStatus::Failed => &mut self.failed,
            ChangeStatus::Blocked => &mut self.blocked,
            ChangeStatus::Expired => &mut self.expired,
            ChangeStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    /// Requests that have not reached a terminal state.
    pub fn in_flight(&self) -> u64 {
        self.pending + self.claimed + self.executing
    }
}

/// Durable change request collection.
#[async_trait]
pub trait ChangeRequestStore: Send + Sync {
    /// Persist a new request, assigning its creation `sequence`.
    async fn insert(&self, request: ChangeRequest) -> Result<ChangeRequest, StoreError>;

    async fn get(&self, id: ChangeRequestId) -> Result<Option<ChangeRequest>, StoreError>;

    /// Pending requests with `earliest_execute_at <= now`, oldest first.
    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError>;

    /// Atomically claim up to `batch_size` eligible requests for `worker_id`.
    ///
    /// Rows another worker is mid-claim on are skipped, never waited for.
    /// Returns the claimed requests ordered by eligibility.
    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError>;

    /// Compare-and-set transition. Fails with `Conflict` when the request is
    /// no longer in `transition.from`.
    async fn transition(
        &self,
        id: ChangeRequestId,
        transition: &Transition,
    ) -> Result<ChangeRequest, StoreError>;

    /// Return requests claimed before `claimed_before` (and never started) to `pending`.
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError>;

    /// Non-terminal requests of `change_type` created before `created_before`
    /// that no live worker owns: pending ones, plus claimed/executing ones
    /// whose claim predates `stale_claim_before`.
    async fn find_overdue(
        &self,
        change_type: ChangeType,
        created_before: DateTime<Utc>,
        stale_claim_before: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError>;

    async fn count_by_status(&self, tenant_id: Option<TenantId>) -> Result<QueueDepth, StoreError>;

    /// Delete terminal requests last updated before `cutoff` (retention).
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Message recorded on a request whose claim was abandoned.
pub(crate) fn abandoned_message(worker: Option<&WorkerId>) -> String {
    match worker {
        Some(w) => format!("claim abandoned by {w}"),
        None => "claim abandoned".to_string(),
    }
}
