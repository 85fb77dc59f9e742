//! Polling worker loop.
//!
//! Each process runs one loop: claim a batch, execute it with bounded
//! concurrency (optionally one in-flight change per entity), sleep when idle,
//! and run maintenance sweeps on their own interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use safeexec_core::{ChangeRequest, Clock};

use super::execute::{ExecuteError, ExecutionOutcome, ExecutionWorker};
use crate::claim::ClaimCoordinator;
use crate::config::ExecutorConfig;
use crate::maintenance::Maintenance;
use crate::store::StoreError;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub blocked: u64,
    pub expired: u64,
    /// Executions that ended in an error instead of an outcome.
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<ExecutionOutcome, ExecuteError>) {
        match result {
            Ok(ExecutionOutcome::Completed { .. }) => self.completed += 1,
            Ok(ExecutionOutcome::Retryable { .. }) => self.retried += 1,
            Ok(ExecutionOutcome::Fatal { .. }) => self.failed += 1,
            Ok(ExecutionOutcome::Blocked { .. }) => self.blocked += 1,
            Ok(ExecutionOutcome::Expired) => self.expired += 1,
            Err(_) => self.errors += 1,
        }
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task panicked");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

pub struct WorkerRunner {
    config: ExecutorConfig,
    coordinator: Arc<ClaimCoordinator>,
    worker: Arc<ExecutionWorker>,
    maintenance: Arc<Maintenance>,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerRunner {
    pub fn new(
        config: ExecutorConfig,
        coordinator: Arc<ClaimCoordinator>,
        worker: Arc<ExecutionWorker>,
        maintenance: Arc<Maintenance>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            coordinator,
            worker,
            maintenance,
            clock,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let worker_id = self.config.worker_id.clone();
        info!(worker_id = %worker_id, "worker started");
        let started = Instant::now();
        let mut last_maintenance: Option<Instant> = None;

        while !*shutdown.borrow() {
            lock_stats(&self.stats).uptime_secs = started.elapsed().as_secs();

            if last_maintenance.is_none_or(|at| at.elapsed() >= self.config.maintenance_interval) {
                if let Err(e) = self.maintenance.run(self.clock.now()).await {
                    error!(worker_id = %worker_id, error = %e, "maintenance sweep failed");
                }
                last_maintenance = Some(Instant::now());
            }

            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to claim change requests");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %worker_id, "worker stopped");
    }

    /// Claim one batch and execute it to completion. Returns the batch size.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let batch = self
            .coordinator
            .claim_batch(self.worker.worker_id(), self.clock.now(), self.config.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let size = batch.len();
        {
            let mut stats = lock_stats(&self.stats);
            stats.batches += 1;
            stats.claimed += size as u64;
        }
        debug!(worker_id = %self.worker.worker_id(), size, "executing batch");

        self.execute_batch(batch).await;
        Ok(size)
    }

    async fn execute_batch(&self, batch: Vec<ChangeRequest>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut entity_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for request in batch {
            let entity_lock = self.config.serialize_per_entity.then(|| {
                entity_locks
                    .entry(request.target_entity_id.clone())
                    .or_default()
                    .clone()
            });
            let permits = permits.clone();
            let worker = self.worker.clone();
            let stats = self.stats.clone();

            tasks.spawn(async move {
                let _entity = match &entity_lock {
                    Some(lock) => Some(lock.lock().await),
                    None => None,
                };
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                let result = worker.execute(request.id).await;
                if let Err(e) = &result {
                    warn!(request_id = %request.id, error = %e, "execution aborted");
                }
                lock_stats(&stats).record(&result);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "execution task panicked");
            }
        }
    }
}
