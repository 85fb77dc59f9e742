//! Append-only audit records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{ChangeRequest, ChangeType, ChangeValue, EntityType};
use crate::error::DomainError;
use crate::id::{ChangeRequestId, TenantId, WorkerId};
use crate::status::ChangeStatus;

/// Why a safety rule rejected a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    LowConfidence,
    RateLimit,
    VelocityLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::LowConfidence => "LOW_CONFIDENCE",
            BlockReason::RateLimit => "RATE_LIMIT",
            BlockReason::VelocityLimit => "VELOCITY_LIMIT",
        }
    }
}

impl core::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW_CONFIDENCE" => Ok(BlockReason::LowConfidence),
            "RATE_LIMIT" => Ok(BlockReason::RateLimit),
            "VELOCITY_LIMIT" => Ok(BlockReason::VelocityLimit),
            other => Err(DomainError::unknown("block reason", other)),
        }
    }
}

/// Classification of a failed request, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed submission, rejected synchronously
    InvalidRequest,
    /// Rejected by a safety rule, terminal `blocked`
    SafetyBlocked,
    /// Network timeout, platform throttling, 5xx: retried
    TransientExecution,
    /// Entity deleted, permission revoked, malformed platform request
    FatalExecution,
    /// Time budget exhausted, terminal `expired`
    Expired,
}

impl FailureKind {
    /// Whether an operator must act on this failure.
    ///
    /// A transient failure only becomes actionable once retries are exhausted.
    pub fn is_alert(&self, retries_exhausted: bool) -> bool {
        match self {
            FailureKind::FatalExecution => true,
            FailureKind::TransientExecution => retries_exhausted,
            _ => false,
        }
    }
}

/// Outcome of each safety check; `None` means the check was not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub confidence_passed: Option<bool>,
    pub rate_limit_passed: Option<bool>,
    pub velocity_check_passed: Option<bool>,
    pub blocked_reason: Option<BlockReason>,
}

impl SafetyCheckResult {
    pub fn is_allowed(&self) -> bool {
        self.blocked_reason.is_none()
    }
}

/// Snapshot of a change request at one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub request_id: ChangeRequestId,
    pub tenant_id: TenantId,
    pub target_entity_id: String,
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    pub current_value: ChangeValue,
    pub requested_value: ChangeValue,
    pub status: ChangeStatus,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub worker_id: Option<WorkerId>,
    pub change_percentage: Option<f64>,
    pub safety_check_result: Option<SafetyCheckResult>,
    pub triggered_by: String,
    pub execution_duration_ms: Option<u64>,
    pub platform_response_summary: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Capture the request's current state.
    pub fn snapshot(request: &ChangeRequest, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            request_id: request.id,
            tenant_id: request.tenant_id,
            target_entity_id: request.target_entity_id.clone(),
            entity_type: request.entity_type,
            change_type: request.change_type,
            current_value: request.current_value,
            requested_value: request.requested_value,
            status: request.status,
            attempt_count: request.attempt_count,
            error_message: request.error_message.clone(),
            worker_id: request.claimed_by.clone(),
            change_percentage: request.change_percentage(),
            safety_check_result: None,
            triggered_by: request.triggered_by.clone(),
            execution_duration_ms: None,
            platform_response_summary: None,
            recorded_at,
        }
    }

    pub fn with_safety(mut self, result: SafetyCheckResult) -> Self {
        self.safety_check_result = Some(result);
        self
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_execution(mut self, duration_ms: u64, summary: impl Into<String>) -> Self {
        self.execution_duration_ms = Some(duration_ms);
        self.platform_response_summary = Some(summary.into());
        self
    }

    pub fn blocked_reason(&self) -> Option<BlockReason> {
        self.safety_check_result.as_ref().and_then(|s| s.blocked_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::NewChangeRequest;

    #[test]
    fn snapshot_copies_request_state() {
        let now = Utc::now();
        let req = ChangeRequest::from_new(
            NewChangeRequest::budget(TenantId::new(), "c-9", 200.0, 150.0, 0.8).triggered_by("bandit"),
            0,
            now,
        )
        .unwrap();

        let record = HistoryRecord::snapshot(&req, now).with_execution(42, "ok");
        assert_eq!(record.request_id, req.id);
        assert_eq!(record.status, ChangeStatus::Pending);
        assert_eq!(record.triggered_by, "bandit");
        assert_eq!(record.change_percentage, Some(-25.0));
        assert_eq!(record.execution_duration_ms, Some(42));
        assert!(record.blocked_reason().is_none());
    }

    #[test]
    fn block_reasons_use_operator_codes() {
        let json = serde_json::to_string(&BlockReason::VelocityLimit).unwrap();
        assert_eq!(json, "\"VELOCITY_LIMIT\"");
        assert_eq!("RATE_LIMIT".parse::<BlockReason>().unwrap(), BlockReason::RateLimit);
    }

    #[test]
    fn only_fatal_and_exhausted_failures_alert() {
        assert!(FailureKind::FatalExecution.is_alert(false));
        assert!(!FailureKind::TransientExecution.is_alert(false));
        assert!(FailureKind::TransientExecution.is_alert(true));
        assert!(!FailureKind::SafetyBlocked.is_alert(true));
    }
}
