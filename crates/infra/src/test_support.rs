//! Shared fixture for unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use safeexec_core::{
    ChangeRequest, ChangeRequestId, ChangeStatus, Clock, ManualClock, NewChangeRequest, PolicyBook, TenantId,
    WorkerId,
};

use crate::claim::ClaimCoordinator;
use crate::config::{ExecutorConfig, SafetyConfig};
use crate::history::InMemoryHistoryLog;
use crate::jitter::JitterScheduler;
use crate::maintenance::Maintenance;
use crate::monitoring::Monitor;
use crate::platform::ScriptedPlatformClient;
use crate::rate::InMemoryRateTracker;
use crate::safety::SafetyEngine;
use crate::service::SafeExecutor;
use crate::store::{ChangeRequestStore, InMemoryChangeRequestStore};
use crate::worker::{ExecutionWorker, WorkerRunner};

pub const API_TIMEOUT: Duration = Duration::from_millis(100);

/// In-memory executor with a manual clock and a scripted platform.
pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<InMemoryChangeRequestStore>,
    pub history: Arc<InMemoryHistoryLog>,
    pub rates: Arc<InMemoryRateTracker>,
    pub platform: Arc<ScriptedPlatformClient>,
    pub policies: PolicyBook,
    pub safety: Arc<SafetyEngine>,
    pub executor: SafeExecutor,
    pub coordinator: Arc<ClaimCoordinator>,
    pub tenant: TenantId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policies(PolicyBook::default())
    }

    pub fn with_policies(policies: PolicyBook) -> Self {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(InMemoryChangeRequestStore::new());
        let history = Arc::new(InMemoryHistoryLog::new());
        let rates = Arc::new(InMemoryRateTracker::new());
        let safety = Arc::new(SafetyEngine::new(
            rates.clone(),
            history.clone(),
            policies.clone(),
            SafetyConfig::default(),
        ));
        let executor = SafeExecutor::new(
            store.clone(),
            history.clone(),
            safety.clone(),
            policies.clone(),
            Arc::new(clock.clone()),
        );
        let coordinator = Arc::new(ClaimCoordinator::new(store.clone(), history.clone()));

        Self {
            clock,
            store,
            history,
            rates,
            platform: Arc::new(ScriptedPlatformClient::new()),
            policies,
            safety,
            executor,
            coordinator,
            tenant: TenantId::new(),
        }
    }

    pub fn worker(&self, name: &str) -> ExecutionWorker {
        ExecutionWorker::new(
            WorkerId::new(name),
            self.store.clone(),
            self.history.clone(),
            self.safety.clone(),
            Arc::new(JitterScheduler::seeded(1)),
            self.platform.clone(),
            self.policies.clone(),
            Arc::new(self.clock.clone()),
            API_TIMEOUT,
        )
    }

    pub fn maintenance(&self, claim_timeout: Duration) -> Maintenance {
        Maintenance::new(
            self.store.clone(),
            self.history.clone(),
            self.rates.clone(),
            self.coordinator.clone(),
            self.policies.clone(),
            claim_timeout,
            Duration::from_secs(90 * 86_400),
        )
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.store.clone(),
            self.history.clone(),
            self.rates.clone(),
            self.policies.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn runner(&self, config: ExecutorConfig) -> WorkerRunner {
        let worker = ExecutionWorker::new(
            config.worker_id.clone(),
            self.store.clone(),
            self.history.clone(),
            self.safety.clone(),
            Arc::new(JitterScheduler::seeded(2)),
            self.platform.clone(),
            self.policies.clone(),
            Arc::new(self.clock.clone()),
            API_TIMEOUT,
        );
        WorkerRunner::new(
            config.clone(),
            self.coordinator.clone(),
            Arc::new(worker),
            Arc::new(self.maintenance(config.claim_timeout)),
            Arc::new(self.clock.clone()),
        )
    }

    /// High-confidence budget change with jitter disabled.
    pub fn budget(&self, entity: &str, current: f64, requested: f64) -> NewChangeRequest {
        NewChangeRequest::budget(self.tenant, entity, current, requested, 0.9).with_jitter(0, 0)
    }

    pub async fn enqueue(&self, new: NewChangeRequest) -> ChangeRequestId {
        self.executor.enqueue(new).await.unwrap().id
    }

    /// Claim `id` for `worker`, asserting it is the next eligible request.
    pub async fn claim(&self, worker: &ExecutionWorker, id: ChangeRequestId) {
        let claimed = self
            .coordinator
            .claim_one(worker.worker_id(), self.clock.now())
            .await
            .unwrap()
            .expect("an eligible request");
        assert_eq!(claimed.id, id);
    }

    pub async fn get(&self, id: ChangeRequestId) -> ChangeRequest {
        self.store.get(id).await.unwrap().expect("request exists")
    }

    pub async fn status(&self, id: ChangeRequestId) -> ChangeStatus {
        self.get(id).await.status
    }

    /// Statuses recorded in `id`'s history, oldest first.
    pub fn trail(&self, id: ChangeRequestId) -> Vec<ChangeStatus> {
        self.history
            .all()
            .unwrap()
            .into_iter()
            .filter(|r| r.request_id == id)
            .map(|r| r.status)
            .collect()
    }
}
