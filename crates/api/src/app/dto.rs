use chrono::{DateTime, Utc};
use serde::Deserialize;

use safeexec_core::{ChangeType, ChangeValue, EntityStatus, EntityType, NewChangeRequest, TenantId};

// -------------------------
// Request DTOs
// -------------------------

/// Attribute value as sent over HTTP: a bare number, a bare status, or the tagged form.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Amount(f64),
    Status(EntityStatus),
    Tagged(ChangeValue),
}

impl From<WireValue> for ChangeValue {
    fn from(v: WireValue) -> Self {
        match v {
            WireValue::Amount(amount) => ChangeValue::Amount(amount),
            WireValue::Status(status) => ChangeValue::Status(status),
            WireValue::Tagged(value) => value,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateChangeRequest {
    pub tenant_id: TenantId,
    pub target_entity_id: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    pub current_value: WireValue,
    pub requested_value: WireValue,
    pub confidence_score: f64,
    pub jitter_min_ms: Option<u64>,
    pub jitter_max_ms: Option<u64>,
    pub earliest_execute_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub override_safety: bool,
}

fn default_entity_type() -> EntityType {
    EntityType::Campaign
}

impl From<CreateChangeRequest> for NewChangeRequest {
    fn from(body: CreateChangeRequest) -> Self {
        NewChangeRequest {
            tenant_id: body.tenant_id,
            target_entity_id: body.target_entity_id,
            entity_type: body.entity_type,
            change_type: body.change_type,
            current_value: body.current_value.into(),
            requested_value: body.requested_value.into(),
            confidence_score: body.confidence_score,
            jitter_min_ms: body.jitter_min_ms,
            jitter_max_ms: body.jitter_max_ms,
            earliest_execute_at: body.earliest_execute_at,
            triggered_by: body.triggered_by,
            override_safety: body.override_safety,
        }
    }
}

// -------------------------
// Query parameters
// -------------------------

#[derive(Debug, Deserialize)]
pub struct QueueDepthQuery {
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitQuery {
    pub tenant_id: TenantId,
    pub change_type: ChangeType,
}

#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    pub tenant_id: Option<TenantId>,
    /// Defaults to the last 24 hours.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct BudgetHistoryQuery {
    pub tenant_id: TenantId,
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

fn default_window_hours() -> u64 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_accept_bare_and_tagged_forms() {
        let body: CreateChangeRequest = serde_json::from_value(serde_json::json!({
            "tenant_id": TenantId::new(),
            "target_entity_id": "c-1",
            "change_type": "budget",
            "current_value": 100.0,
            "requested_value": {"amount": 120.0},
            "confidence_score": 0.9
        }))
        .unwrap();
        let new = NewChangeRequest::from(body);
        assert_eq!(new.current_value, ChangeValue::Amount(100.0));
        assert_eq!(new.requested_value, ChangeValue::Amount(120.0));
        assert_eq!(new.entity_type, EntityType::Campaign);

        let status: WireValue = serde_json::from_value(serde_json::json!("paused")).unwrap();
        assert_eq!(ChangeValue::from(status), ChangeValue::Status(EntityStatus::Paused));
    }
}
