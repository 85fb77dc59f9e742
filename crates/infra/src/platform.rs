//! Advertising platform collaborator.
//!
//! The executor only needs two calls: apply one change, and read an
//! entity's current value (used to resolve ambiguous outcomes after a timeout).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use safeexec_core::{ChangeRequest, ChangeRequestId, ChangeType, ChangeValue, EntityType, TenantId};

/// One mutation sent to the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformChange {
    pub request_id: ChangeRequestId,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub target_entity_id: String,
    pub change_type: ChangeType,
    pub current_value: ChangeValue,
    pub requested_value: ChangeValue,
}

impl From<&ChangeRequest> for PlatformChange {
    fn from(request: &ChangeRequest) -> Self {
        Self {
            request_id: request.id,
            tenant_id: request.tenant_id,
            entity_type: request.entity_type,
            target_entity_id: request.target_entity_id.clone(),
            change_type: request.change_type,
            current_value: request.current_value,
            requested_value: request.requested_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformResponse {
    /// Short description kept in the audit log.
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlatformError {
    /// Timeouts, throttling, 5xx. Safe to retry.
    #[error("transient platform error: {0}")]
    Transient(String),
    /// Deleted entity, revoked permission, malformed request. Never retried.
    #[error("fatal platform error: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn apply_change(&self, change: &PlatformChange) -> Result<PlatformResponse, PlatformError>;

    /// Current value of the attribute a change type targets; `None` if unknown.
    async fn current_value(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        change_type: ChangeType,
    ) -> Result<Option<ChangeValue>, PlatformError>;
}

type ValueKey = (String, ChangeType);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Logs changes instead of sending them; remembers applied values.
#[derive(Debug, Default)]
pub struct DryRunPlatformClient {
    values: Mutex<HashMap<ValueKey, ChangeValue>>,
}

impl DryRunPlatformClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlatformClient for DryRunPlatformClient {
    async fn apply_change(&self, change: &PlatformChange) -> Result<PlatformResponse, PlatformError> {
        info!(
            request_id = %change.request_id,
            entity_id = %change.target_entity_id,
            change_type = %change.change_type,
            from = %change.current_value,
            to = %change.requested_value,
            "dry run: platform change skipped"
        );
        lock(&self.values).insert(
            (change.target_entity_id.clone(), change.change_type),
            change.requested_value,
        );
        Ok(PlatformResponse {
            summary: format!("dry run: {} -> {}", change.current_value, change.requested_value),
        })
    }

    async fn current_value(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
        change_type: ChangeType,
    ) -> Result<Option<ChangeValue>, PlatformError> {
        Ok(lock(&self.values).get(&(entity_id.to_string(), change_type)).copied())
    }
}

/// Scripted behavior of one platform call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Succeed,
    /// Succeed after a delay.
    SucceedAfter(Duration),
    Transient(String),
    Fatal(String),
    /// Never answer (until the caller's timeout fires).
    Hang,
    /// Apply the change, then never answer: an ambiguous outcome.
    ApplyThenHang,
}

/// Test double that replays scripted outcomes in order; succeeds once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedPlatformClient {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    reads: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<PlatformChange>>,
    values: Mutex<HashMap<ValueKey, ChangeValue>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_per_entity: AtomicUsize,
}

impl ScriptedPlatformClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        let client = Self::new();
        client.push(outcomes);
        client
    }

    pub fn push(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        lock(&self.script).extend(outcomes);
    }

    /// Script `current_value` reads. `Hang`, `Transient` and `Fatal` behave as for
    /// changes; anything else, or an empty script, answers from recorded values.
    pub fn push_reads(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        lock(&self.reads).extend(outcomes);
    }

    pub fn set_current_value(&self, entity_id: &str, change_type: ChangeType, value: ChangeValue) {
        lock(&self.values).insert((entity_id.to_string(), change_type), value);
    }

    /// Every `apply_change` call received, in order.
    pub fn calls(&self) -> Vec<PlatformChange> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of simultaneous calls observed against any single entity.
    pub fn max_in_flight_per_entity(&self) -> usize {
        self.max_in_flight_per_entity.load(Ordering::SeqCst)
    }

    fn enter(&self, entity_id: &str) {
        let mut in_flight = lock(&self.in_flight);
        let n = in_flight.entry(entity_id.to_string()).or_insert(0);
        *n += 1;
        self.max_in_flight_per_entity.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, entity_id: &str) {
        if let Some(n) = lock(&self.in_flight).get_mut(entity_id) {
            *n = n.saturating_sub(1);
        }
    }

    fn record_applied(&self, change: &PlatformChange) {
        lock(&self.values).insert(
            (change.target_entity_id.clone(), change.change_type),
            change.requested_value,
        );
    }

    async fn run(&self, change: &PlatformChange, outcome: ScriptedOutcome) -> Result<PlatformResponse, PlatformError> {
        let ok = || PlatformResponse {
            summary: format!("applied {}", change.requested_value),
        };
        match outcome {
            ScriptedOutcome::Succeed => {
                self.record_applied(change);
                Ok(ok())
            }
            ScriptedOutcome::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.record_applied(change);
                Ok(ok())
            }
            ScriptedOutcome::Transient(msg) => Err(PlatformError::Transient(msg)),
            ScriptedOutcome::Fatal(msg) => Err(PlatformError::Fatal(msg)),
            ScriptedOutcome::Hang => std::future::pending().await,
            ScriptedOutcome::ApplyThenHang => {
                self.record_applied(change);
                std::future::pending().await
            }
        }
    }
}

/// Decrements the in-flight counter even when the call future is dropped by a timeout.
struct InFlight<'a> {
    client: &'a ScriptedPlatformClient,
    entity_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.client.leave(self.entity_id);
    }
}

#[async_trait]
impl PlatformClient for ScriptedPlatformClient {
    async fn apply_change(&self, change: &PlatformChange) -> Result<PlatformResponse, PlatformError> {
        lock(&self.calls).push(change.clone());
        let outcome = lock(&self.script).pop_front().unwrap_or(ScriptedOutcome::Succeed);

        self.enter(&change.target_entity_id);
        let _guard = InFlight {
            client: self,
            entity_id: &change.target_entity_id,
        };
        self.run(change, outcome).await
    }

    async fn current_value(
        &self,
        _entity_type: EntityType,
        entity_id: &str,
        change_type: ChangeType,
    ) -> Result<Option<ChangeValue>, PlatformError> {
        let scripted = lock(&self.reads).pop_front();
        match scripted {
            Some(ScriptedOutcome::Hang | ScriptedOutcome::ApplyThenHang) => std::future::pending().await,
            Some(ScriptedOutcome::Transient(msg)) => Err(PlatformError::Transient(msg)),
            Some(ScriptedOutcome::Fatal(msg)) => Err(PlatformError::Fatal(msg)),
            _ => Ok(lock(&self.values).get(&(entity_id.to_string(), change_type)).copied()),
        }
    }
}
