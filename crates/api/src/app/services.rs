use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use safeexec_core::{Clock, SystemClock};
use safeexec_infra::{
    Backends, ClaimCoordinator, ExecutionWorker, ExecutorConfig, JitterScheduler, Maintenance, Monitor,
    PlatformClient, SafeExecutor, SafetyEngine, WorkerRunner, config, schema,
};

/// Everything the HTTP handlers and the worker loop share.
pub struct AppServices {
    pub config: ExecutorConfig,
    pub backends: Backends,
    pub clock: Arc<dyn Clock>,
    pub executor: SafeExecutor,
    pub monitor: Monitor,
    safety: Arc<SafetyEngine>,
}

impl AppServices {
    /// Wire services over `backends`. `config.policies` is used as the policy book.
    pub fn new(config: ExecutorConfig, backends: Backends, clock: Arc<dyn Clock>) -> Self {
        let safety = Arc::new(SafetyEngine::new(
            backends.rates.clone(),
            backends.history.clone(),
            config.policies.clone(),
            config.safety.clone(),
        ));
        let executor = SafeExecutor::new(
            backends.store.clone(),
            backends.history.clone(),
            safety.clone(),
            config.policies.clone(),
            clock.clone(),
        );
        let monitor = Monitor::new(
            backends.store.clone(),
            backends.history.clone(),
            backends.rates.clone(),
            config.policies.clone(),
            clock.clone(),
        );

        Self {
            config,
            backends,
            clock,
            executor,
            monitor,
            safety,
        }
    }

    pub fn in_memory(config: ExecutorConfig) -> Self {
        Self::new(config, Backends::in_memory(), Arc::new(SystemClock))
    }

    /// Build from the environment: Postgres when `USE_PERSISTENT_STORES=true`, in-memory otherwise.
    pub async fn build(mut config: ExecutorConfig) -> anyhow::Result<Self> {
        if !config::use_persistent_stores() {
            warn!("using in-memory stores; state is lost on restart");
            return Ok(Self::in_memory(config));
        }

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;
        schema::migrate(&pool).await?;

        // An explicit policy file wins over the job_type_configs table.
        if std::env::var_os("SAFEEXEC_JOB_TYPES_FILE").is_none() {
            config.policies = schema::load_policies(&pool).await?;
        }
        info!("using Postgres stores");

        Ok(Self::new(config, Backends::postgres(pool), Arc::new(SystemClock)))
    }

    pub fn is_persistent(&self) -> bool {
        config::use_persistent_stores()
    }

    /// Worker loop over the same stores and safety engine.
    pub fn worker_runner(&self, platform: Arc<dyn PlatformClient>) -> WorkerRunner {
        let backends = &self.backends;
        let coordinator = Arc::new(ClaimCoordinator::new(backends.store.clone(), backends.history.clone()));
        let worker = ExecutionWorker::new(
            self.config.worker_id.clone(),
            backends.store.clone(),
            backends.history.clone(),
            self.safety.clone(),
            Arc::new(JitterScheduler::new()),
            platform,
            self.config.policies.clone(),
            self.clock.clone(),
            self.config.api_timeout,
        );
        let maintenance = Maintenance::new(
            backends.store.clone(),
            backends.history.clone(),
            backends.rates.clone(),
            coordinator.clone(),
            self.config.policies.clone(),
            self.config.claim_timeout,
            self.config.retention,
        );

        WorkerRunner::new(
            self.config.clone(),
            coordinator,
            Arc::new(worker),
            Arc::new(maintenance),
            self.clock.clone(),
        )
    }
}
