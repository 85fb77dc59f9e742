//! Execution of a single claimed change request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use safeexec_core::{
    BlockReason, ChangeRequest, ChangeRequestId, ChangeStatus, Clock, FailureKind, HistoryRecord,
    PolicyBook, SafetyCheckResult, Transition, WorkerId,
};

use crate::history::HistoryLog;
use crate::jitter::JitterScheduler;
use crate::platform::{PlatformChange, PlatformClient, PlatformError};
use crate::safety::SafetyEngine;
use crate::store::{ChangeRequestStore, StoreError};

/// Terminal or rescheduled result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// `verified` = an earlier ambiguous attempt had already applied the change.
    Completed { verified: bool },
    /// Back to `pending`, eligible again at `next_attempt_at`.
    Retryable {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal `failed`.
    Fatal { error: String, retries_exhausted: bool },
    Blocked { reason: BlockReason },
    Expired,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("change request not found: {0}")]
    NotFound(ChangeRequestId),
    /// Terminal requests are never re-executed.
    #[error("change request {id} is already {status}")]
    AlreadyTerminal { id: ChangeRequestId, status: ChangeStatus },
    #[error("change request {id} is not claimed by {worker}")]
    NotClaimed { id: ChangeRequestId, worker: WorkerId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of re-reading an entity after an ambiguous attempt.
enum Verification {
    Applied,
    NotApplied,
    Unknown(String),
}

/// Drives one claimed request through jitter, safety, and the platform call.
pub struct ExecutionWorker {
    worker_id: WorkerId,
    store: Arc<dyn ChangeRequestStore>,
    history: Arc<dyn HistoryLog>,
    safety: Arc<SafetyEngine>,
    jitter: Arc<JitterScheduler>,
    platform: Arc<dyn PlatformClient>,
    policies: PolicyBook,
    clock: Arc<dyn Clock>,
    api_timeout: Duration,
}

impl ExecutionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        store: Arc<dyn ChangeRequestStore>,
        history: Arc<dyn HistoryLog>,
        safety: Arc<SafetyEngine>,
        jitter: Arc<JitterScheduler>,
        platform: Arc<dyn PlatformClient>,
        policies: PolicyBook,
        clock: Arc<dyn Clock>,
        api_timeout: Duration,
    ) -> Self {
        Self {
            worker_id,
            store,
            history,
            safety,
            jitter,
            platform,
            policies,
            clock,
            api_timeout,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    #[instrument(skip(self), fields(worker_id = %self.worker_id), err)]
    pub async fn execute(&self, id: ChangeRequestId) -> Result<ExecutionOutcome, ExecuteError> {
        let request = self.store.get(id).await?.ok_or(ExecuteError::NotFound(id))?;
        if request.status.is_terminal() {
            return Err(ExecuteError::AlreadyTerminal {
                id,
                status: request.status,
            });
        }
        if request.status != ChangeStatus::Claimed || request.claimed_by.as_ref() != Some(&self.worker_id) {
            return Err(self.not_claimed(id));
        }

        let policy = self.policies.get(request.change_type);
        let now = self.clock.now();
        if policy.is_expired(request.created_at, now) {
            let message = format!("expired before execution ({}s budget)", policy.expire_in_seconds);
            self.record(Transition::expire(ChangeStatus::Claimed, now, message), id, |r| r)
                .await?;
            info!(request_id = %id, "change request expired before execution");
            return Ok(ExecutionOutcome::Expired);
        }

        let delay = self.jitter.delay(&request);
        if !delay.is_zero() {
            debug!(request_id = %id, delay_ms = delay.as_millis() as u64, "applying jitter");
            tokio::time::sleep(delay).await;
        }

        let now = self.clock.now();
        let start = Transition::start_executing(self.worker_id.clone(), now);
        let request = match self.store.transition(id, &start).await {
            Ok(request) => request,
            // Reclaimed, re-claimed by another worker, or expired while we slept.
            Err(StoreError::Conflict(_)) => return Err(self.not_claimed(id)),
            Err(e) => return Err(e.into()),
        };
        self.history.append(HistoryRecord::snapshot(&request, now)).await?;

        let decision = self.safety.evaluate_for_execution(&request, now).await?;
        let Some(reason) = decision.blocked_reason() else {
            return self.call_platform(request, decision.result).await;
        };

        let message = decision.error_message().unwrap_or_else(|| reason.to_string());
        self.record(Transition::block(ChangeStatus::Executing, now, message.clone()), id, |r| {
            r.with_safety(decision.result.clone())
        })
        .await?;
        warn!(
            request_id = %id,
            failure_kind = ?FailureKind::SafetyBlocked,
            reason = %reason,
            error = %message,
            "change request blocked at execution"
        );
        Ok(ExecutionOutcome::Blocked { reason })
    }

    async fn call_platform(
        &self,
        request: ChangeRequest,
        safety: SafetyCheckResult,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let id = request.id;

        if request.needs_verification {
            match self.verify(&request).await {
                Verification::Applied => {
                    let now = self.clock.now();
                    let summary = format!("verified: entity already at {}", request.requested_value);
                    self.record(Transition::complete(now), id, |r| {
                        r.with_safety(safety.clone()).with_execution(0, summary.clone())
                    })
                    .await?;
                    info!(request_id = %id, "ambiguous earlier attempt confirmed applied");
                    return Ok(ExecutionOutcome::Completed { verified: true });
                }
                Verification::NotApplied => {}
                // Never re-apply blind; stay flagged and try again later.
                Verification::Unknown(message) => {
                    let now = self.clock.now();
                    return self.handle_transient(&request, message, true, 0, now).await;
                }
            }
        }

        let change = PlatformChange::from(&request);
        let started = Instant::now();
        let result = tokio::time::timeout(self.api_timeout, self.platform.apply_change(&change)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let now = self.clock.now();

        match result {
            Ok(Ok(response)) => {
                self.record(Transition::complete(now), id, |r| {
                    r.with_safety(safety.clone())
                        .with_execution(duration_ms, response.summary.clone())
                })
                .await?;
                info!(
                    request_id = %id,
                    entity_id = %request.target_entity_id,
                    change_type = %request.change_type,
                    duration_ms,
                    "change applied"
                );
                Ok(ExecutionOutcome::Completed { verified: false })
            }
            Ok(Err(PlatformError::Fatal(message))) => {
                self.record(Transition::fail(now, message.clone()), id, |r| {
                    r.with_safety(safety.clone()).with_execution(duration_ms, message.clone())
                })
                .await?;
                error!(
                    failure_kind = ?FailureKind::FatalExecution,
                    alert = true,
                    request_id = %id,
                    entity_id = %request.target_entity_id,
                    error = %message,
                    "fatal platform error"
                );
                Ok(ExecutionOutcome::Fatal {
                    error: message,
                    retries_exhausted: false,
                })
            }
            Ok(Err(PlatformError::Transient(message))) => {
                self.handle_transient(&request, message, false, duration_ms, now).await
            }
            Err(_elapsed) => {
                let message = format!("platform call timed out after {}ms", self.api_timeout.as_millis());
                self.handle_transient(&request, message, true, duration_ms, now).await
            }
        }
    }

    /// Retry with backoff while the policy and expiry window allow it.
    async fn handle_transient(
        &self,
        request: &ChangeRequest,
        message: String,
        ambiguous: bool,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let id = request.id;
        let policy = self.policies.get(request.change_type);

        if policy.is_expired(request.created_at, now) {
            let expired_message = format!("expired after transient error: {message}");
            self.record(Transition::expire(ChangeStatus::Executing, now, expired_message), id, |r| {
                r.with_execution(duration_ms, message.clone())
            })
            .await?;
            info!(request_id = %id, "change request expired during retries");
            return Ok(ExecutionOutcome::Expired);
        }

        if policy.should_retry(request.attempt_count) {
            let attempt = request.attempt_count + 1;
            let backoff = chrono::Duration::from_std(policy.backoff(attempt)).unwrap_or_else(|_| chrono::Duration::zero());
            let next_attempt_at = now + backoff;
            self.record(Transition::retry(now, next_attempt_at, message.clone(), ambiguous), id, |r| {
                r.with_execution(duration_ms, message.clone())
            })
            .await?;
            warn!(
                request_id = %id,
                attempt,
                max_retries = policy.max_retry_attempts,
                backoff_ms = backoff.num_milliseconds(),
                ambiguous,
                error = %message,
                "transient platform error, retry scheduled"
            );
            return Ok(ExecutionOutcome::Retryable {
                error: message,
                next_attempt_at,
            });
        }

        let final_message = format!("retries exhausted: {message}");
        self.record(Transition::fail(now, final_message.clone()), id, |r| {
            r.with_execution(duration_ms, message.clone())
        })
        .await?;
        error!(
            failure_kind = ?FailureKind::TransientExecution,
            alert = true,
            request_id = %id,
            entity_id = %request.target_entity_id,
            attempts = request.attempt_count + 1,
            error = %message,
            "change request failed after exhausting retries"
        );
        Ok(ExecutionOutcome::Fatal {
            error: final_message,
            retries_exhausted: true,
        })
    }

    /// Whether the entity already holds the requested value.
    async fn verify(&self, request: &ChangeRequest) -> Verification {
        let lookup = self.platform.current_value(
            request.entity_type,
            &request.target_entity_id,
            request.change_type,
        );
        match tokio::time::timeout(self.api_timeout, lookup).await {
            Ok(Ok(Some(value))) if value.is_equivalent(&request.requested_value) => Verification::Applied,
            Ok(Ok(_)) => Verification::NotApplied,
            Ok(Err(e)) => {
                warn!(request_id = %request.id, error = %e, "verification read failed");
                Verification::Unknown(format!("verification read failed: {e}"))
            }
            Err(_) => {
                warn!(request_id = %request.id, "verification read timed out");
                Verification::Unknown(format!(
                    "verification read timed out after {}ms",
                    self.api_timeout.as_millis()
                ))
            }
        }
    }

    /// Apply a transition and append the resulting snapshot.
    async fn record(
        &self,
        transition: Transition,
        id: ChangeRequestId,
        decorate: impl FnOnce(HistoryRecord) -> HistoryRecord,
    ) -> Result<ChangeRequest, ExecuteError> {
        let updated = self.store.transition(id, &transition).await?;
        let record = decorate(HistoryRecord::snapshot(&updated, transition.at).with_worker(self.worker_id.clone()));
        self.history.append(record).await?;
        Ok(updated)
    }

    fn not_claimed(&self, id: ChangeRequestId) -> ExecuteError {
        ExecuteError::NotClaimed {
            id,
            worker: self.worker_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use safeexec_core::{ChangeType, JobTypeConfig};

    use super::*;
    use crate::platform::ScriptedOutcome;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn successful_execution_records_full_trail() {
        let h = Harness::new();
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;

        let outcome = worker.execute(id).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed { verified: false });

        let request = h.get(id).await;
        assert_eq!(request.status, ChangeStatus::Completed);
        assert!(request.executed_at.is_some());
        assert_eq!(
            h.trail(id),
            vec![
                ChangeStatus::Pending,
                ChangeStatus::Claimed,
                ChangeStatus::Executing,
                ChangeStatus::Completed
            ]
        );

        let last = h.history.all().unwrap().pop().unwrap();
        assert_eq!(last.worker_id, Some(WorkerId::new("w-1")));
        assert!(last.platform_response_summary.is_some());
        assert_eq!(h.platform.call_count(), 1);
    }

    #[tokio::test]
    async fn fatal_platform_error_fails_without_retry() {
        let h = Harness::new();
        h.platform.push([ScriptedOutcome::Fatal("campaign archived".into())]);
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;

        let outcome = worker.execute(id).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Fatal {
                error: "campaign archived".into(),
                retries_exhausted: false
            }
        );
        let request = h.get(id).await;
        assert_eq!(request.status, ChangeStatus::Failed);
        assert_eq!(request.attempt_count, 1);
        assert_eq!(request.error_message.as_deref(), Some("campaign archived"));
    }

    #[tokio::test]
    async fn only_the_owner_may_execute() {
        let h = Harness::new();
        let owner = h.worker("w-1");
        let intruder = h.worker("w-2");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;

        let err = owner.execute(id).await.unwrap_err();
        assert!(matches!(err, ExecuteError::NotClaimed { .. }));

        h.claim(&owner, id).await;
        let err = intruder.execute(id).await.unwrap_err();
        assert!(matches!(err, ExecuteError::NotClaimed { .. }));
        assert_eq!(h.platform.call_count(), 0);
    }

    #[tokio::test]
    async fn terminal_requests_are_never_re_executed() {
        let h = Harness::new();
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;
        worker.execute(id).await.unwrap();

        let err = worker.execute(id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::AlreadyTerminal {
                status: ChangeStatus::Completed,
                ..
            }
        ));
        assert_eq!(h.platform.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let h = Harness::new();
        let err = h.worker("w-1").execute(ChangeRequestId::new()).await.unwrap_err();
        assert!(matches!(err, ExecuteError::NotFound(_)));
    }

    #[tokio::test]
    async fn rate_budget_is_rechecked_at_execution() {
        let budget = JobTypeConfig {
            rate_limit_per_tenant_per_hour: Some(1),
            ..PolicyBook::default().get(ChangeType::Budget)
        };
        let h = Harness::with_policies(PolicyBook::default().with(ChangeType::Budget, budget));
        let worker = h.worker("w-1");

        // Both pass the enqueue check; only one fits in the hour.
        let first = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        let second = h.enqueue(h.budget("c-2", 100.0, 110.0)).await;

        h.claim(&worker, first).await;
        assert_eq!(worker.execute(first).await.unwrap(), ExecutionOutcome::Completed { verified: false });

        h.claim(&worker, second).await;
        assert_eq!(
            worker.execute(second).await.unwrap(),
            ExecutionOutcome::Blocked {
                reason: BlockReason::RateLimit
            }
        );
        let blocked = h.get(second).await;
        assert_eq!(blocked.status, ChangeStatus::Blocked);
        assert!(blocked.error_message.unwrap().starts_with("RATE_LIMIT"));

        let record = h.history.all().unwrap().pop().unwrap();
        assert_eq!(record.blocked_reason(), Some(BlockReason::RateLimit));
        assert_eq!(h.platform.call_count(), 1);
    }

    #[tokio::test]
    async fn overdue_claims_expire_instead_of_executing() {
        let h = Harness::new();
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;

        h.clock.advance(chrono::Duration::hours(2));
        assert_eq!(worker.execute(id).await.unwrap(), ExecutionOutcome::Expired);
        assert_eq!(h.status(id).await, ChangeStatus::Expired);
        assert_eq!(h.platform.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_error_schedules_backoff() {
        let h = Harness::new();
        h.platform.push([ScriptedOutcome::Transient("503 from platform".into())]);
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;

        let now = h.clock.now();
        let ExecutionOutcome::Retryable { next_attempt_at, .. } = worker.execute(id).await.unwrap() else {
            panic!("expected a retry");
        };
        assert_eq!(next_attempt_at, now + chrono::Duration::milliseconds(5_000));

        let request = h.get(id).await;
        assert_eq!(request.status, ChangeStatus::Pending);
        assert_eq!(request.attempt_count, 1);
        assert!(request.claimed_by.is_none());
        assert!(!request.needs_verification);
        assert!(!request.is_eligible(h.clock.now()));
    }

    #[tokio::test]
    async fn ambiguous_timeout_is_verified_before_reapplying() {
        let h = Harness::new();
        h.platform.push([ScriptedOutcome::ApplyThenHang]);
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;

        let outcome = worker.execute(id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Retryable { .. }));
        assert!(h.get(id).await.needs_verification);

        h.clock.advance(chrono::Duration::seconds(6));
        h.claim(&worker, id).await;
        assert_eq!(worker.execute(id).await.unwrap(), ExecutionOutcome::Completed { verified: true });

        assert_eq!(h.platform.call_count(), 1);
        let request = h.get(id).await;
        assert!(!request.needs_verification);
        assert_eq!(request.attempt_count, 1);
    }

    #[tokio::test]
    async fn unverifiable_ambiguous_outcome_is_rescheduled_not_reapplied() {
        let h = Harness::new();
        h.platform.push([ScriptedOutcome::ApplyThenHang]);
        h.platform.push_reads([ScriptedOutcome::Hang]);
        let worker = h.worker("w-1");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0)).await;
        h.claim(&worker, id).await;
        assert!(matches!(worker.execute(id).await.unwrap(), ExecutionOutcome::Retryable { .. }));

        h.clock.advance(chrono::Duration::seconds(6));
        h.claim(&worker, id).await;
        let ExecutionOutcome::Retryable { error, .. } = worker.execute(id).await.unwrap() else {
            panic!("expected a retry");
        };
        assert!(error.starts_with("verification read timed out"));
        assert_eq!(h.platform.call_count(), 1);

        let request = h.get(id).await;
        assert_eq!(request.status, ChangeStatus::Pending);
        assert!(request.needs_verification);
        assert_eq!(request.attempt_count, 2);

        // Reads answer again: the earlier attempt is confirmed, still no second mutation.
        h.clock.advance(chrono::Duration::seconds(11));
        h.claim(&worker, id).await;
        assert_eq!(worker.execute(id).await.unwrap(), ExecutionOutcome::Completed { verified: true });
        assert_eq!(h.platform.call_count(), 1);
    }

    #[tokio::test]
    async fn claim_retaken_during_jitter_is_not_executed_by_the_old_owner() {
        let h = Harness::new();
        let stale = h.worker("w-a");
        let fresh = h.worker("w-b");
        let id = h.enqueue(h.budget("c-1", 100.0, 110.0).with_jitter(300, 300)).await;
        h.claim(&stale, id).await;

        let (stale_outcome, ()) = tokio::join!(stale.execute(id), async {
            // `stale` is asleep in its jitter delay by now.
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.clock.advance(chrono::Duration::minutes(6));
            let report = h.maintenance(Duration::from_secs(300)).run(h.clock.now()).await.unwrap();
            assert_eq!(report.reclaimed, 1);
            h.claim(&fresh, id).await;
        });

        assert!(matches!(stale_outcome, Err(ExecuteError::NotClaimed { .. })));
        assert_eq!(h.platform.call_count(), 0);
        let request = h.get(id).await;
        assert_eq!(request.status, ChangeStatus::Claimed);
        assert_eq!(request.claimed_by, Some(WorkerId::new("w-b")));

        assert_eq!(fresh.execute(id).await.unwrap(), ExecutionOutcome::Completed { verified: false });
        assert_eq!(h.platform.call_count(), 1);
    }
}
