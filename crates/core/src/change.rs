//! Change requests: a single requested mutation to one external entity.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ChangeRequestId, TenantId, WorkerId};
use crate::status::{ChangeStatus, Transition};

/// Default lower jitter bound applied when the requester omits one.
pub const DEFAULT_JITTER_MIN_MS: u64 = 3_000;
/// Default upper jitter bound applied when the requester omits one.
pub const DEFAULT_JITTER_MAX_MS: u64 = 18_000;
/// Largest accepted jitter bound (one day).
pub const MAX_JITTER_MS: u64 = 86_400_000;

/// Smallest absolute amount difference considered a real change.
const MATERIAL_AMOUNT_DELTA: f64 = 0.005;

/// Kind of advertising-platform object targeted by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Campaign,
    AdSet,
    Ad,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Campaign => "campaign",
            EntityType::AdSet => "ad_set",
            EntityType::Ad => "ad",
        }
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaign" => Ok(EntityType::Campaign),
            "ad_set" => Ok(EntityType::AdSet),
            "ad" => Ok(EntityType::Ad),
            other => Err(DomainError::unknown("entity type", other)),
        }
    }
}

/// Kind of mutation. Policy (retries, expiry, rate limits) is configured per change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Budget,
    Bid,
    Status,
}

impl ChangeType {
    pub const ALL: [ChangeType; 3] = [ChangeType::Budget, ChangeType::Bid, ChangeType::Status];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Budget => "budget",
            ChangeType::Bid => "bid",
            ChangeType::Status => "status",
        }
    }

    /// Budget and bid changes carry a percentage swing and are velocity guarded.
    pub fn is_amount(&self) -> bool {
        matches!(self, ChangeType::Budget | ChangeType::Bid)
    }
}

impl core::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown("change type", s))
    }
}

/// Delivery status of a platform entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Paused,
}

/// Value of the mutated attribute: an amount for budget/bid, a status otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeValue {
    Amount(f64),
    Status(EntityStatus),
}

impl ChangeValue {
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            ChangeValue::Amount(v) => Some(*v),
            ChangeValue::Status(_) => None,
        }
    }

    /// Whether `other` is the same value for the purpose of deciding if a change is needed.
    pub fn is_equivalent(&self, other: &ChangeValue) -> bool {
        match (self, other) {
            (ChangeValue::Amount(a), ChangeValue::Amount(b)) => (a - b).abs() < MATERIAL_AMOUNT_DELTA,
            (ChangeValue::Status(a), ChangeValue::Status(b)) => a == b,
            _ => false,
        }
    }
}

impl core::fmt::Display for ChangeValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChangeValue::Amount(v) => write!(f, "{v:.2}"),
            ChangeValue::Status(EntityStatus::Active) => f.write_str("active"),
            ChangeValue::Status(EntityStatus::Paused) => f.write_str("paused"),
        }
    }
}

/// Signed relative swing, in percent, between two amounts.
///
/// A positive change from zero counts as a full `+100%` swing.
pub fn percentage_change(current: f64, requested: f64) -> f64 {
    if current.abs() < f64::EPSILON {
        if requested > 0.0 { 100.0 } else { 0.0 }
    } else {
        (requested - current) / current * 100.0
    }
}

/// A change as submitted by an upstream agent, before validation and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeRequest {
    pub tenant_id: TenantId,
    pub target_entity_id: String,
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    pub current_value: ChangeValue,
    pub requested_value: ChangeValue,
    pub confidence_score: f64,
    #[serde(default)]
    pub jitter_min_ms: Option<u64>,
    #[serde(default)]
    pub jitter_max_ms: Option<u64>,
    #[serde(default)]
    pub earliest_execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    /// Manual override: skips the confidence and velocity checks (never the rate limit).
    #[serde(default)]
    pub override_safety: bool,
}

impl NewChangeRequest {
    fn amount_change(
        tenant_id: TenantId,
        target_entity_id: impl Into<String>,
        change_type: ChangeType,
        current: f64,
        requested: f64,
        confidence_score: f64,
    ) -> Self {
        Self {
            tenant_id,
            target_entity_id: target_entity_id.into(),
            entity_type: EntityType::Campaign,
            change_type,
            current_value: ChangeValue::Amount(current),
            requested_value: ChangeValue::Amount(requested),
            confidence_score,
            jitter_min_ms: None,
            jitter_max_ms: None,
            earliest_execute_at: None,
            triggered_by: None,
            override_safety: false,
        }
    }

    /// A campaign budget change.
    pub fn budget(
        tenant_id: TenantId,
        target_entity_id: impl Into<String>,
        current: f64,
        requested: f64,
        confidence_score: f64,
    ) -> Self {
        Self::amount_change(tenant_id, target_entity_id, ChangeType::Budget, current, requested, confidence_score)
    }

    /// A campaign bid change.
    pub fn bid(
        tenant_id: TenantId,
        target_entity_id: impl Into<String>,
        current: f64,
        requested: f64,
        confidence_score: f64,
    ) -> Self {
        Self::amount_change(tenant_id, target_entity_id, ChangeType::Bid, current, requested, confidence_score)
    }

    /// A pause/activate change.
    pub fn status(
        tenant_id: TenantId,
        target_entity_id: impl Into<String>,
        current: EntityStatus,
        requested: EntityStatus,
        confidence_score: f64,
    ) -> Self {
        Self {
            change_type: ChangeType::Status,
            current_value: ChangeValue::Status(current),
            requested_value: ChangeValue::Status(requested),
            ..Self::amount_change(tenant_id, target_entity_id, ChangeType::Status, 0.0, 0.0, confidence_score)
        }
    }

    pub fn on_entity(mut self, entity_type: EntityType) -> Self {
        self.entity_type = entity_type;
        self
    }

    pub fn with_jitter(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.jitter_min_ms = Some(min_ms);
        self.jitter_max_ms = Some(max_ms);
        self
    }

    pub fn execute_at(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_execute_at = Some(at);
        self
    }

    pub fn triggered_by(mut self, agent: impl Into<String>) -> Self {
        self.triggered_by = Some(agent.into());
        self
    }

    pub fn with_override(mut self) -> Self {
        self.override_safety = true;
        self
    }

    /// Reject malformed or no-op changes.
    pub fn validate(&self) -> DomainResult<()> {
        if self.target_entity_id.trim().is_empty() {
            return Err(DomainError::invalid_request("target_entity_id must not be empty"));
        }
        if !self.confidence_score.is_finite() || !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(DomainError::invalid_request(format!(
                "confidence_score must be within [0, 1], got {}",
                self.confidence_score
            )));
        }

        let jitter_min = self.jitter_min_ms.unwrap_or(DEFAULT_JITTER_MIN_MS);
        let jitter_max = self.jitter_max_ms.unwrap_or(DEFAULT_JITTER_MAX_MS);
        if jitter_min > jitter_max {
            return Err(DomainError::invalid_request(format!(
                "jitter_min_ms ({jitter_min}) exceeds jitter_max_ms ({jitter_max})"
            )));
        }
        if jitter_max > MAX_JITTER_MS {
            return Err(DomainError::invalid_request(format!(
                "jitter_max_ms ({jitter_max}) exceeds {MAX_JITTER_MS}"
            )));
        }

        match (self.change_type.is_amount(), self.current_value, self.requested_value) {
            (true, ChangeValue::Amount(current), ChangeValue::Amount(requested)) => {
                for (name, v) in [("current_value", current), ("requested_value", requested)] {
                    if !v.is_finite() || v < 0.0 {
                        return Err(DomainError::invalid_request(format!(
                            "{name} must be a non-negative amount, got {v}"
                        )));
                    }
                }
            }
            (false, ChangeValue::Status(_), ChangeValue::Status(_)) => {}
            _ => {
                return Err(DomainError::invalid_request(format!(
                    "values do not match change type {}",
                    self.change_type
                )));
            }
        }

        if self.requested_value.is_equivalent(&self.current_value) {
            return Err(DomainError::invalid_request(format!(
                "requested value {} does not differ from current value {}",
                self.requested_value, self.current_value
            )));
        }

        Ok(())
    }
}

/// A persisted change request.
///
/// `requested_value` is fixed at creation; a different change is a new request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeRequestId,
    /// Store-assigned creation order, used to break ties between equal eligibility times.
    pub sequence: u64,
    pub tenant_id: TenantId,
    pub target_entity_id: String,
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    pub current_value: ChangeValue,
    pub requested_value: ChangeValue,
    pub confidence_score: f64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub status: ChangeStatus,
    pub earliest_execute_at: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Number of failed execution attempts.
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub priority: i32,
    pub override_safety: bool,
    /// Set after an ambiguous platform call; the next attempt re-reads entity state first.
    pub needs_verification: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeRequest {
    /// Validate a submission and build a `pending` request with defaults applied.
    pub fn from_new(new: NewChangeRequest, priority: i32, now: DateTime<Utc>) -> DomainResult<Self> {
        new.validate()?;

        Ok(Self {
            id: ChangeRequestId::new(),
            sequence: 0,
            tenant_id: new.tenant_id,
            target_entity_id: new.target_entity_id,
            entity_type: new.entity_type,
            change_type: new.change_type,
            current_value: new.current_value,
            requested_value: new.requested_value,
            confidence_score: new.confidence_score,
            jitter_min_ms: new.jitter_min_ms.unwrap_or(DEFAULT_JITTER_MIN_MS),
            jitter_max_ms: new.jitter_max_ms.unwrap_or(DEFAULT_JITTER_MAX_MS),
            status: ChangeStatus::Pending,
            earliest_execute_at: new.earliest_execute_at.unwrap_or(now),
            claimed_by: None,
            claimed_at: None,
            executed_at: None,
            attempt_count: 0,
            error_message: None,
            triggered_by: new.triggered_by.unwrap_or_else(|| "unknown".to_string()),
            priority,
            override_safety: new.override_safety,
            needs_verification: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Signed percentage swing of this change; `None` for status changes.
    pub fn change_percentage(&self) -> Option<f64> {
        match (self.current_value, self.requested_value) {
            (ChangeValue::Amount(current), ChangeValue::Amount(requested)) => {
                Some(percentage_change(current, requested))
            }
            _ => None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == ChangeStatus::Pending && self.earliest_execute_at <= now
    }

    /// Apply a transition, enforcing compare-and-set on the current status and
    /// the lifecycle's legal moves.
    pub fn apply(&mut self, t: &Transition) -> DomainResult<()> {
        if self.status != t.from {
            return Err(DomainError::invalid_transition(format!(
                "request {} is {}, expected {}",
                self.id, self.status, t.from
            )));
        }
        if !t.from.can_transition_to(t.to) {
            return Err(DomainError::invalid_transition(format!(
                "{} -> {} is not permitted",
                t.from, t.to
            )));
        }
        if t.from == ChangeStatus::Claimed && t.worker_id.is_some() && self.claimed_by != t.worker_id {
            return Err(DomainError::invalid_transition(format!(
                "request {} is claimed by {}, not {}",
                self.id,
                self.claimed_by.as_ref().map_or("nobody", WorkerId::as_str),
                t.worker_id.as_ref().map_or("nobody", WorkerId::as_str),
            )));
        }

        self.status = t.to;
        self.updated_at = t.at;

        match t.to {
            ChangeStatus::Claimed => {
                self.claimed_by = t.worker_id.clone();
                self.claimed_at = Some(t.at);
            }
            ChangeStatus::Pending => {
                self.claimed_by = None;
                self.claimed_at = None;
                if let Some(next) = t.earliest_execute_at {
                    self.earliest_execute_at = next;
                }
            }
            ChangeStatus::Executing => {
                self.executed_at = Some(t.at);
            }
            _ => {}
        }

        if t.increment_attempts {
            self.attempt_count += 1;
        }
        if let Some(msg) = &t.error_message {
            self.error_message = Some(msg.clone());
        }
        if let Some(flag) = t.needs_verification {
            self.needs_verification = flag;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tenant() -> TenantId {
        TenantId::new()
    }

    fn pending(new: NewChangeRequest) -> ChangeRequest {
        ChangeRequest::from_new(new, 0, Utc::now()).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let now = Utc::now();
        let req = ChangeRequest::from_new(NewChangeRequest::budget(tenant(), "c-1", 100.0, 120.0, 0.9), 7, now)
            .unwrap();

        assert_eq!(req.status, ChangeStatus::Pending);
        assert_eq!(req.jitter_min_ms, DEFAULT_JITTER_MIN_MS);
        assert_eq!(req.jitter_max_ms, DEFAULT_JITTER_MAX_MS);
        assert_eq!(req.earliest_execute_at, now);
        assert_eq!(req.priority, 7);
        assert_eq!(req.triggered_by, "unknown");
        assert!(req.claimed_by.is_none());
    }

    #[test]
    fn no_op_changes_are_rejected() {
        let err = NewChangeRequest::budget(tenant(), "c-1", 100.0, 100.001, 0.9)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));

        let err = NewChangeRequest::status(tenant(), "ad-1", EntityStatus::Paused, EntityStatus::Paused, 0.9)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));
    }

    #[test]
    fn inverted_jitter_is_rejected() {
        let err = NewChangeRequest::bid(tenant(), "c-1", 1.0, 2.0, 0.9)
            .with_jitter(5_000, 1_000)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(msg) if msg.contains("jitter")));

        let err = NewChangeRequest::bid(tenant(), "c-1", 1.0, 2.0, 0.9)
            .with_jitter(0, u64::MAX)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(msg) if msg.contains("jitter_max_ms")));
    }

    #[test]
    fn mismatched_value_kinds_are_rejected() {
        let mut new = NewChangeRequest::budget(tenant(), "c-1", 10.0, 20.0, 0.9);
        new.requested_value = ChangeValue::Status(EntityStatus::Paused);
        assert!(new.validate().is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        assert!(NewChangeRequest::budget(tenant(), "c-1", 10.0, 20.0, 1.5).validate().is_err());
        assert!(NewChangeRequest::budget(tenant(), "c-1", 10.0, 20.0, f64::NAN).validate().is_err());
        assert!(NewChangeRequest::budget(tenant(), "", 10.0, 20.0, 0.5).validate().is_err());
    }

    #[test]
    fn change_percentage_is_signed() {
        let up = pending(NewChangeRequest::budget(tenant(), "c-1", 100.0, 120.0, 0.9));
        let down = pending(NewChangeRequest::budget(tenant(), "c-1", 100.0, 75.0, 0.9));
        let status = pending(NewChangeRequest::status(tenant(), "c-1", EntityStatus::Active, EntityStatus::Paused, 0.9));

        assert!((up.change_percentage().unwrap() - 20.0).abs() < 1e-9);
        assert!((down.change_percentage().unwrap() + 25.0).abs() < 1e-9);
        assert!(status.change_percentage().is_none());
        assert_eq!(percentage_change(0.0, 50.0), 100.0);
    }

    #[test]
    fn claim_then_retry_clears_ownership() {
        let mut req = pending(NewChangeRequest::budget(tenant(), "c-1", 100.0, 120.0, 0.9));
        let now = Utc::now();
        let worker = WorkerId::new("w-1");

        req.apply(&Transition::claim(worker.clone(), now)).unwrap();
        assert_eq!(req.claimed_by.as_ref(), Some(&worker));
        assert_eq!(req.claimed_at, Some(now));

        req.apply(&Transition::start_executing(worker.clone(), now)).unwrap();
        let next = now + Duration::seconds(5);
        req.apply(&Transition::retry(now, next, "timeout", true)).unwrap();

        assert_eq!(req.status, ChangeStatus::Pending);
        assert!(req.claimed_by.is_none());
        assert!(req.claimed_at.is_none());
        assert_eq!(req.attempt_count, 1);
        assert_eq!(req.earliest_execute_at, next);
        assert!(req.needs_verification);
    }

    #[test]
    fn stale_transition_is_refused() {
        let mut req = pending(NewChangeRequest::budget(tenant(), "c-1", 100.0, 120.0, 0.9));
        let err = req
            .apply(&Transition::start_executing(WorkerId::new("w-1"), Utc::now()))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(req.status, ChangeStatus::Pending);
    }

    #[test]
    fn only_the_current_owner_starts_execution() {
        let mut req = pending(NewChangeRequest::budget(tenant(), "c-1", 100.0, 120.0, 0.9));
        let now = Utc::now();
        req.apply(&Transition::claim(WorkerId::new("w-a"), now)).unwrap();
        req.apply(&Transition::release(now, "claim abandoned")).unwrap();
        req.apply(&Transition::claim(WorkerId::new("w-b"), now)).unwrap();

        let err = req
            .apply(&Transition::start_executing(WorkerId::new("w-a"), now))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(req.status, ChangeStatus::Claimed);
        assert_eq!(req.claimed_by, Some(WorkerId::new("w-b")));

        req.apply(&Transition::start_executing(WorkerId::new("w-b"), now)).unwrap();
        assert_eq!(req.status, ChangeStatus::Executing);
    }

    #[test]
    fn values_serialize_tagged() {
        let json = serde_json::to_value(ChangeValue::Amount(12.5)).unwrap();
        assert_eq!(json, serde_json::json!({"amount": 12.5}));
        let json = serde_json::to_value(ChangeValue::Status(EntityStatus::Paused)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "paused"}));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: scaling an amount by `1 + p/100` reports a swing of `p` percent.
            #[test]
            fn percentage_matches_scaling(current in 1.0f64..1_000_000.0, pct in -99.0f64..500.0) {
                let requested = current * (1.0 + pct / 100.0);
                prop_assert!((percentage_change(current, requested) - pct).abs() < 1e-6);
            }
        }
    }
}
