//! Safety rule engine.
//!
//! Rules run in a fixed order and short-circuit on the first block:
//! confidence, hourly rate limit, then budget/bid velocity. Manual overrides
//! skip confidence and velocity but never the rate limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use safeexec_core::{BlockReason, ChangeRequest, PolicyBook, SafetyCheckResult};

use crate::config::SafetyConfig;
use crate::history::HistoryLog;
use crate::rate::{RateCheck, RateTracker};
use crate::store::StoreError;

/// Verdict of one safety evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyDecision {
    pub result: SafetyCheckResult,
    /// Human-readable explanation when blocked.
    pub detail: Option<String>,
    pub rate: Option<RateCheck>,
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        self.result.is_allowed()
    }

    pub fn blocked_reason(&self) -> Option<BlockReason> {
        self.result.blocked_reason
    }

    /// Message recorded on a blocked request.
    pub fn error_message(&self) -> Option<String> {
        let reason = self.result.blocked_reason?;
        Some(match &self.detail {
            Some(detail) => format!("{reason}: {detail}"),
            None => reason.to_string(),
        })
    }

    fn block(mut result: SafetyCheckResult, reason: BlockReason, detail: String, rate: Option<RateCheck>) -> Self {
        result.blocked_reason = Some(reason);
        Self {
            result,
            detail: Some(detail),
            rate,
        }
    }
}

pub struct SafetyEngine {
    rates: Arc<dyn RateTracker>,
    history: Arc<dyn HistoryLog>,
    policies: PolicyBook,
    config: SafetyConfig,
}

impl SafetyEngine {
    pub fn new(
        rates: Arc<dyn RateTracker>,
        history: Arc<dyn HistoryLog>,
        policies: PolicyBook,
        config: SafetyConfig,
    ) -> Self {
        Self {
            rates,
            history,
            policies,
            config,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Run every rule without consuming rate budget.
    pub async fn evaluate(&self, request: &ChangeRequest, now: DateTime<Utc>) -> Result<SafetyDecision, StoreError> {
        let mut result = SafetyCheckResult::default();

        if !request.override_safety {
            let passed = request.confidence_score >= self.config.min_confidence;
            result.confidence_passed = Some(passed);
            if !passed {
                let detail = format!(
                    "confidence {:.2} below minimum {:.2}",
                    request.confidence_score, self.config.min_confidence
                );
                return Ok(SafetyDecision::block(result, BlockReason::LowConfidence, detail, None));
            }
        }

        let limit = self.policies.get(request.change_type).rate_limit_per_tenant_per_hour;
        let rate = self
            .rates
            .check_and_maybe_increment(request.tenant_id, request.change_type, now, limit, false)
            .await?;
        result.rate_limit_passed = Some(rate.allowed);
        if !rate.allowed {
            let detail = rate_detail(request, &rate);
            return Ok(SafetyDecision::block(result, BlockReason::RateLimit, detail, Some(rate)));
        }

        if request.change_type.is_amount() && !request.override_safety {
            let window = chrono::Duration::from_std(self.config.velocity_window)
                .unwrap_or_else(|_| chrono::Duration::hours(6));
            let applied = self
                .history
                .velocity_sum(request.tenant_id, &request.target_entity_id, request.change_type, now - window)
                .await?;
            let requested = request.change_percentage().unwrap_or(0.0).abs();
            let passed = applied.abs() + requested <= self.config.velocity_cap_percent;
            result.velocity_check_passed = Some(passed);
            if !passed {
                let detail = format!(
                    "{applied:.1}% already applied + {requested:.1}% requested exceeds {:.1}% cap",
                    self.config.velocity_cap_percent
                );
                return Ok(SafetyDecision::block(result, BlockReason::VelocityLimit, detail, Some(rate)));
            }
        }

        Ok(SafetyDecision {
            result,
            detail: None,
            rate: Some(rate),
        })
    }

    /// Run every rule and, when all pass, consume one unit of rate budget.
    ///
    /// Losing the increment race to a concurrent worker blocks with `RATE_LIMIT`.
    pub async fn evaluate_for_execution(
        &self,
        request: &ChangeRequest,
        now: DateTime<Utc>,
    ) -> Result<SafetyDecision, StoreError> {
        let decision = self.evaluate(request, now).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        let limit = self.policies.get(request.change_type).rate_limit_per_tenant_per_hour;
        let rate = self
            .rates
            .check_and_maybe_increment(request.tenant_id, request.change_type, now, limit, true)
            .await?;

        if rate.allowed {
            debug!(request_id = %request.id, count = rate.current_count, "rate budget consumed");
            return Ok(SafetyDecision {
                result: decision.result,
                detail: None,
                rate: Some(rate),
            });
        }

        let mut result = decision.result;
        result.rate_limit_passed = Some(false);
        let detail = rate_detail(request, &rate);
        Ok(SafetyDecision::block(result, BlockReason::RateLimit, detail, Some(rate)))
    }
}

fn rate_detail(request: &ChangeRequest, rate: &RateCheck) -> String {
    format!(
        "{}/{} {} changes this hour for tenant {}",
        rate.current_count,
        rate.limit.map_or_else(|| "unlimited".to_string(), |l| l.to_string()),
        request.change_type,
        request.tenant_id
    )
}

#[cfg(test)]
mod tests {
    use safeexec_core::{
        ChangeType, EntityStatus, HistoryRecord, NewChangeRequest, TenantId, Transition, WorkerId,
    };

    use super::*;
    use crate::history::InMemoryHistoryLog;
    use crate::rate::InMemoryRateTracker;

    struct Fixture {
        engine: SafetyEngine,
        history: Arc<InMemoryHistoryLog>,
    }

    fn fixture(budget_limit: Option<u32>) -> Fixture {
        let history = Arc::new(InMemoryHistoryLog::new());
        let mut budget = PolicyBook::default().get(ChangeType::Budget);
        budget.rate_limit_per_tenant_per_hour = budget_limit;
        let policies = PolicyBook::default().with(ChangeType::Budget, budget);
        let engine = SafetyEngine::new(
            Arc::new(InMemoryRateTracker::new()),
            history.clone(),
            policies,
            SafetyConfig::default(),
        );
        Fixture { engine, history }
    }

    fn budget(tenant: TenantId, current: f64, requested: f64, confidence: f64) -> ChangeRequest {
        ChangeRequest::from_new(
            NewChangeRequest::budget(tenant, "c-1", current, requested, confidence),
            0,
            Utc::now(),
        )
        .unwrap()
    }

    async fn record_completed(history: &InMemoryHistoryLog, mut req: ChangeRequest, at: DateTime<Utc>) {
        req.apply(&Transition::claim(WorkerId::new("w"), at)).unwrap();
        req.apply(&Transition::start_executing(WorkerId::new("w"), at)).unwrap();
        req.apply(&Transition::complete(at)).unwrap();
        history.append(HistoryRecord::snapshot(&req, at)).await.unwrap();
    }

    #[tokio::test]
    async fn low_confidence_short_circuits() {
        let f = fixture(Some(0));
        let decision = f.engine.evaluate(&budget(TenantId::new(), 100.0, 110.0, 0.5), Utc::now()).await.unwrap();

        assert_eq!(decision.blocked_reason(), Some(BlockReason::LowConfidence));
        assert_eq!(decision.result.confidence_passed, Some(false));
        assert_eq!(decision.result.rate_limit_passed, None);
        assert!(decision.error_message().unwrap().starts_with("LOW_CONFIDENCE"));
    }

    #[tokio::test]
    async fn override_skips_confidence_and_velocity_but_not_rate() {
        let f = fixture(Some(0));
        let mut req = budget(TenantId::new(), 100.0, 400.0, 0.1);
        req.override_safety = true;

        let decision = f.engine.evaluate(&req, Utc::now()).await.unwrap();
        assert_eq!(decision.result.confidence_passed, None);
        assert_eq!(decision.blocked_reason(), Some(BlockReason::RateLimit));

        let f = fixture(None);
        let decision = f.engine.evaluate(&req, Utc::now()).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.result.velocity_check_passed, None);
    }

    #[tokio::test]
    async fn velocity_guard_blocks_third_twenty_percent_swing() {
        let f = fixture(None);
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..2 {
            let req = budget(tenant, 100.0, 120.0, 0.9);
            let decision = f.engine.evaluate(&req, now).await.unwrap();
            assert!(decision.is_allowed());
            record_completed(&f.history, req, now).await;
        }

        let third = f.engine.evaluate(&budget(tenant, 100.0, 120.0, 0.9), now).await.unwrap();
        assert_eq!(third.blocked_reason(), Some(BlockReason::VelocityLimit));
        assert_eq!(third.result.velocity_check_passed, Some(false));
    }

    #[tokio::test]
    async fn status_changes_skip_velocity() {
        let f = fixture(None);
        let req = ChangeRequest::from_new(
            NewChangeRequest::status(TenantId::new(), "ad-1", EntityStatus::Active, EntityStatus::Paused, 0.9),
            0,
            Utc::now(),
        )
        .unwrap();
        let decision = f.engine.evaluate(&req, Utc::now()).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.result.velocity_check_passed, None);
    }

    #[tokio::test]
    async fn execution_consumes_rate_budget() {
        let f = fixture(Some(2));
        let tenant = TenantId::new();
        let now = Utc::now();

        assert!(f.engine.evaluate_for_execution(&budget(tenant, 100.0, 101.0, 0.9), now).await.unwrap().is_allowed());
        assert!(f.engine.evaluate_for_execution(&budget(tenant, 100.0, 101.0, 0.9), now).await.unwrap().is_allowed());

        let third = f.engine.evaluate_for_execution(&budget(tenant, 100.0, 101.0, 0.9), now).await.unwrap();
        assert_eq!(third.blocked_reason(), Some(BlockReason::RateLimit));
        assert_eq!(third.rate.unwrap().current_count, 2);
    }

    #[test]
    fn unlimited_rate_is_described() {
        let req = budget(TenantId::new(), 1.0, 2.0, 0.9);
        let rate = RateCheck {
            allowed: true,
            current_count: 3,
            limit: None,
            window_start: Utc::now(),
            window_end: Utc::now(),
        };
        assert!(rate_detail(&req, &rate).starts_with("3/unlimited budget"));
    }
}
