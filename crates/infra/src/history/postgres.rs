//! Postgres-backed history log over the `change_history` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use safeexec_core::{
    ChangeRequestId, ChangeType, HistoryRecord, SafetyCheckResult, TenantId, WorkerId,
};

use super::{EntityHistoryQuery, HistoryLog};
use crate::pg::{corrupt, map_sqlx_error};
use crate::store::StoreError;

const COLUMNS: &str = r#"
    id, request_id, tenant_id, target_entity_id, entity_type, change_type,
    current_value, requested_value, status, attempt_count, error_message, worker_id,
    change_percentage, safety_check_result, triggered_by, execution_duration_ms,
    platform_response_summary, recorded_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresHistoryLog {
    pool: PgPool,
}

impl PostgresHistoryLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(tx: &mut Transaction<'_, Postgres>, record: &HistoryRecord) -> Result<(), StoreError> {
        let to_json = |v| serde_json::to_value(v).map_err(|e| StoreError::Storage(e.to_string()));
        let current_value = to_json(record.current_value)?;
        let requested_value = to_json(record.requested_value)?;
        let safety = record
            .safety_check_result
            .as_ref()
            .map(|s| serde_json::to_value(s).map_err(|e| StoreError::Storage(e.to_string())))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO change_history (
                id, request_id, tenant_id, target_entity_id, entity_type, change_type,
                current_value, requested_value, status, attempt_count, error_message, worker_id,
                change_percentage, safety_check_result, triggered_by, execution_duration_ms,
                platform_response_summary, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(record.id)
        .bind(record.request_id.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(&record.target_entity_id)
        .bind(record.entity_type.as_str())
        .bind(record.change_type.as_str())
        .bind(current_value)
        .bind(requested_value)
        .bind(record.status.as_str())
        .bind(record.attempt_count as i32)
        .bind(&record.error_message)
        .bind(record.worker_id.as_ref().map(WorkerId::as_str))
        .bind(record.change_percentage)
        .bind(safety)
        .bind(&record.triggered_by)
        .bind(record.execution_duration_ms.map(|ms| ms as i64))
        .bind(&record.platform_response_summary)
        .bind(record.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("history_append", e))?;

        Ok(())
    }
}

#[async_trait]
impl HistoryLog for PostgresHistoryLog {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.append_batch(vec![record]).await
    }

    async fn append_batch(&self, records: Vec<HistoryRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("history_append", e))?;
        for record in &records {
            Self::insert(&mut tx, record).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("history_append", e))
    }

    async fn velocity_sum(
        &self,
        tenant_id: TenantId,
        target_entity_id: &str,
        change_type: ChangeType,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(ABS(change_percentage)), 0)::DOUBLE PRECISION AS total
            FROM change_history
            WHERE tenant_id = $1
              AND target_entity_id = $2
              AND change_type = $3
              AND status = 'completed'
              AND recorded_at >= $4
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(target_entity_id)
        .bind(change_type.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("velocity_sum", e))?;

        row.try_get("total").map_err(|e| map_sqlx_error("velocity_sum", e))
    }

    async fn list_for_request(&self, request_id: ChangeRequestId) -> Result<Vec<HistoryRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM change_history WHERE request_id = $1 ORDER BY recorded_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(request_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_for_request", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn list_for_entity(&self, query: EntityHistoryQuery) -> Result<Vec<HistoryRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM change_history
            WHERE tenant_id = $1
              AND target_entity_id = $2
              AND ($3::text IS NULL OR change_type = $3)
              AND recorded_at >= $4
            ORDER BY recorded_at DESC, id DESC
            LIMIT $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.tenant_id.as_uuid())
            .bind(&query.target_entity_id)
            .bind(query.change_type.map(|t| t.as_str()))
            .bind(query.since)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_for_entity", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn list_failures(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM change_history
            WHERE status IN ('failed', 'blocked')
              AND recorded_at >= $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY recorded_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(tenant_id.map(Uuid::from))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_failures", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM change_history WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("history_purge", e))?;
        Ok(result.rows_affected())
    }
}

fn decode_row(row: &PgRow) -> Result<HistoryRecord, StoreError> {
    let get_err = |e| map_sqlx_error("decode_history", e);

    let request_id: Uuid = row.try_get("request_id").map_err(get_err)?;
    let tenant_id: Uuid = row.try_get("tenant_id").map_err(get_err)?;
    let entity_type: String = row.try_get("entity_type").map_err(get_err)?;
    let change_type: String = row.try_get("change_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(get_err)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(get_err)?;
    let current_value: serde_json::Value = row.try_get("current_value").map_err(get_err)?;
    let requested_value: serde_json::Value = row.try_get("requested_value").map_err(get_err)?;
    let safety: Option<serde_json::Value> = row.try_get("safety_check_result").map_err(get_err)?;
    let duration_ms: Option<i64> = row.try_get("execution_duration_ms").map_err(get_err)?;

    Ok(HistoryRecord {
        id: row.try_get("id").map_err(get_err)?,
        request_id: ChangeRequestId::from_uuid(request_id),
        tenant_id: TenantId::from_uuid(tenant_id),
        target_entity_id: row.try_get("target_entity_id").map_err(get_err)?,
        entity_type: entity_type.parse().map_err(|e| corrupt("entity_type", e))?,
        change_type: change_type.parse().map_err(|e| corrupt("change_type", e))?,
        current_value: serde_json::from_value(current_value).map_err(|e| corrupt("current_value", e))?,
        requested_value: serde_json::from_value(requested_value).map_err(|e| corrupt("requested_value", e))?,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        attempt_count: attempt_count as u32,
        error_message: row.try_get("error_message").map_err(get_err)?,
        worker_id: worker_id.map(WorkerId::new),
        change_percentage: row.try_get("change_percentage").map_err(get_err)?,
        safety_check_result: safety
            .map(serde_json::from_value::<SafetyCheckResult>)
            .transpose()
            .map_err(|e| corrupt("safety_check_result", e))?,
        triggered_by: row.try_get("triggered_by").map_err(get_err)?,
        execution_duration_ms: duration_ms.map(|ms| ms as u64),
        platform_response_summary: row.try_get("platform_response_summary").map_err(get_err)?,
        recorded_at: row.try_get("recorded_at").map_err(get_err)?,
    })
}
