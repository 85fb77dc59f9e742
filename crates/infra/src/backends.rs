//! Storage backend selection.

use std::sync::Arc;

use sqlx::PgPool;

use crate::history::{HistoryLog, InMemoryHistoryLog, PostgresHistoryLog};
use crate::rate::{InMemoryRateTracker, PostgresRateTracker, RateTracker};
use crate::store::{ChangeRequestStore, InMemoryChangeRequestStore, PostgresChangeRequestStore};

/// The three persistence ports, backed by the same system.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ChangeRequestStore>,
    pub history: Arc<dyn HistoryLog>,
    pub rates: Arc<dyn RateTracker>,
}

impl Backends {
    /// Process-local state, lost on restart.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryChangeRequestStore::new()),
            history: Arc::new(InMemoryHistoryLog::new()),
            rates: Arc::new(InMemoryRateTracker::new()),
        }
    }

    /// Shared Postgres state; run [`crate::schema::migrate`] first.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            store: Arc::new(PostgresChangeRequestStore::new(pool.clone())),
            history: Arc::new(PostgresHistoryLog::new(pool.clone())),
            rates: Arc::new(PostgresRateTracker::new(pool)),
        }
    }
}
