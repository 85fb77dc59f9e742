//! Change request lifecycle: statuses and the transitions between them.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::WorkerId;

/// Lifecycle status of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Waiting for `earliest_execute_at` and a worker
    Pending,
    /// Exclusively owned by one worker, not yet calling the platform
    Claimed,
    /// Platform call in flight
    Executing,
    Completed,
    Failed,
    /// Rejected by a safety rule
    Blocked,
    Expired,
    /// Withdrawn by the upstream agent before any worker claimed it
    Cancelled,
}

impl ChangeStatus {
    pub const ALL: [ChangeStatus; 8] = [
        ChangeStatus::Pending,
        ChangeStatus::Claimed,
        ChangeStatus::Executing,
        ChangeStatus::Completed,
        ChangeStatus::Failed,
        ChangeStatus::Blocked,
        ChangeStatus::Expired,
        ChangeStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Claimed => "claimed",
            ChangeStatus::Executing => "executing",
            ChangeStatus::Completed => "completed",
            ChangeStatus::Failed => "failed",
            ChangeStatus::Blocked => "blocked",
            ChangeStatus::Expired => "expired",
            ChangeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Completed
                | ChangeStatus::Failed
                | ChangeStatus::Blocked
                | ChangeStatus::Expired
                | ChangeStatus::Cancelled
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        match self {
            Pending => matches!(next, Claimed | Blocked | Expired | Cancelled),
            Claimed => matches!(next, Executing | Pending | Expired),
            Executing => matches!(next, Completed | Failed | Blocked | Pending | Expired),
            Completed | Failed | Blocked | Expired | Cancelled => false,
        }
    }
}

impl core::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown("change status", s))
    }
}

/// A requested state transition, applied with compare-and-set semantics:
/// it only succeeds while the request is still in `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ChangeStatus,
    pub to: ChangeStatus,
    pub at: DateTime<Utc>,
    /// Owner recorded on `pending -> claimed`; expected owner on `claimed -> executing`.
    pub worker_id: Option<WorkerId>,
    /// New eligibility instant when returning to `pending`.
    pub earliest_execute_at: Option<DateTime<Utc>>,
    pub increment_attempts: bool,
    pub error_message: Option<String>,
    pub needs_verification: Option<bool>,
}

impl Transition {
    fn new(from: ChangeStatus, to: ChangeStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            worker_id: None,
            earliest_execute_at: None,
            increment_attempts: false,
            error_message: None,
            needs_verification: None,
        }
    }

    pub fn claim(worker_id: WorkerId, at: DateTime<Utc>) -> Self {
        Self {
            worker_id: Some(worker_id),
            ..Self::new(ChangeStatus::Pending, ChangeStatus::Claimed, at)
        }
    }

    /// Return an abandoned claim to the queue.
    pub fn release(at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::new(ChangeStatus::Claimed, ChangeStatus::Pending, at)
        }
    }

    /// Only succeeds while `worker_id` still holds the claim.
    pub fn start_executing(worker_id: WorkerId, at: DateTime<Utc>) -> Self {
        Self {
            worker_id: Some(worker_id),
            ..Self::new(ChangeStatus::Claimed, ChangeStatus::Executing, at)
        }
    }

    pub fn complete(at: DateTime<Utc>) -> Self {
        Self {
            needs_verification: Some(false),
            ..Self::new(ChangeStatus::Executing, ChangeStatus::Completed, at)
        }
    }

    /// Schedule another attempt after a transient failure.
    pub fn retry(
        at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        error: impl Into<String>,
        needs_verification: bool,
    ) -> Self {
        Self {
            earliest_execute_at: Some(next_attempt_at),
            increment_attempts: true,
            error_message: Some(error.into()),
            needs_verification: Some(needs_verification),
            ..Self::new(ChangeStatus::Executing, ChangeStatus::Pending, at)
        }
    }

    pub fn fail(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            increment_attempts: true,
            error_message: Some(error.into()),
            ..Self::new(ChangeStatus::Executing, ChangeStatus::Failed, at)
        }
    }

    pub fn block(from: ChangeStatus, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::new(from, ChangeStatus::Blocked, at)
        }
    }

    pub fn expire(from: ChangeStatus, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::new(from, ChangeStatus::Expired, at)
        }
    }

    pub fn cancel(at: DateTime<Utc>) -> Self {
        Self {
            error_message: Some("cancelled by requester".to_string()),
            ..Self::new(ChangeStatus::Pending, ChangeStatus::Cancelled, at)
        }
    }

    /// Same transition, but for an attempt that failed without reaching the platform.
    pub fn without_attempt(mut self) -> Self {
        self.increment_attempts = false;
        self
    }
}
