//! Postgres schema setup and policy loading.

use sqlx::{PgPool, Row};
use tracing::info;

use safeexec_core::{ChangeType, JobTypeConfig, PolicyBook};

use crate::pg::{corrupt, map_sqlx_error};
use crate::store::StoreError;

/// Idempotent DDL for every table the executor uses.
pub const MIGRATION: &str = include_str!("../migrations/0001_safe_executor.sql");

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    info!("schema up to date");
    Ok(())
}

/// Read `job_type_configs`, falling back to built-in defaults for missing types.
pub async fn load_policies(pool: &PgPool) -> Result<PolicyBook, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT change_type, max_retry_attempts, retry_backoff_base_ms, retry_backoff_max_ms,
               expire_in_seconds, rate_limit_per_tenant_per_hour, default_priority
        FROM job_type_configs
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| map_sqlx_error("load_policies", e))?;

    let mut book = PolicyBook::default();
    for row in rows {
        let get_err = |e| map_sqlx_error("load_policies", e);
        let change_type: String = row.try_get("change_type").map_err(get_err)?;
        let change_type: ChangeType = change_type.parse().map_err(|e| corrupt("change_type", e))?;
        let max_retry_attempts: i32 = row.try_get("max_retry_attempts").map_err(get_err)?;
        let base_ms: i64 = row.try_get("retry_backoff_base_ms").map_err(get_err)?;
        let max_ms: Option<i64> = row.try_get("retry_backoff_max_ms").map_err(get_err)?;
        let expire_in_seconds: i64 = row.try_get("expire_in_seconds").map_err(get_err)?;
        let rate_limit: Option<i32> = row.try_get("rate_limit_per_tenant_per_hour").map_err(get_err)?;

        book = book.with(
            change_type,
            JobTypeConfig {
                max_retry_attempts: max_retry_attempts.max(0) as u32,
                retry_backoff_base_ms: base_ms.max(0) as u64,
                retry_backoff_max_ms: max_ms.map(|ms| ms.max(0) as u64),
                expire_in_seconds: expire_in_seconds.max(0) as u64,
                rate_limit_per_tenant_per_hour: rate_limit.map(|l| l.max(0) as u32),
                default_priority: row.try_get("default_priority").map_err(get_err)?,
            },
        );
    }
    Ok(book)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_creates_every_collection() {
        for table in ["change_requests", "job_type_configs", "rate_window_counters", "change_history"] {
            assert!(
                MIGRATION.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing {table}"
            );
        }
        assert!(MIGRATION.contains("WHERE status = 'pending'"));
    }
}
