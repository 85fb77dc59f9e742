//! Postgres-backed rate tracker over `rate_window_counters`.
//!
//! The increment is a single conditional upsert: the `DO UPDATE ... WHERE`
//! clause refuses the bump once the limit is reached and then returns no row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use safeexec_core::{ChangeType, TenantId};

use super::{RateCheck, RateTracker, hour_window, within_limit};
use crate::pg::map_sqlx_error;
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct PostgresRateTracker {
    pool: PgPool,
}

impl PostgresRateTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn read_count(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
        window_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT count FROM rate_window_counters
            WHERE tenant_id = $1 AND change_type = $2 AND window_start = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(change_type.as_str())
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("rate_read", e))?;

        match row {
            Some(row) => {
                let count: i32 = row.try_get("count").map_err(|e| map_sqlx_error("rate_read", e))?;
                Ok(count.max(0) as u32)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl RateTracker for PostgresRateTracker {
    async fn check_and_maybe_increment(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
        now: DateTime<Utc>,
        limit: Option<u32>,
        increment: bool,
    ) -> Result<RateCheck, StoreError> {
        let (window_start, window_end) = hour_window(now);
        let check = |allowed, current_count| RateCheck {
            allowed,
            current_count,
            limit,
            window_start,
            window_end,
        };

        // A zero limit would otherwise be bypassed by the INSERT branch.
        if !increment || limit == Some(0) {
            let count = self.read_count(tenant_id, change_type, window_start).await?;
            return Ok(check(within_limit(count, limit), count));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO rate_window_counters (tenant_id, change_type, window_start, window_end, count)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (tenant_id, change_type, window_start)
            DO UPDATE SET count = rate_window_counters.count + 1
            WHERE $5::int IS NULL OR rate_window_counters.count < $5
            RETURNING count
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(change_type.as_str())
        .bind(window_start)
        .bind(window_end)
        .bind(limit.map(|l| l.min(i32::MAX as u32) as i32))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("rate_increment", e))?;

        match row {
            Some(row) => {
                let count: i32 = row.try_get("count").map_err(|e| map_sqlx_error("rate_increment", e))?;
                Ok(check(true, count.max(0) as u32))
            }
            None => {
                let count = self.read_count(tenant_id, change_type, window_start).await?;
                Ok(check(false, count))
            }
        }
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_window_counters WHERE window_end < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("rate_purge", e))?;
        Ok(result.rows_affected())
    }
}
