//! Postgres-backed change request store.
//!
//! ## Claiming
//!
//! `claim_batch` selects eligible rows with `FOR UPDATE SKIP LOCKED` and flips
//! them to `claimed` in the same statement. Two workers polling concurrently
//! lock disjoint rows; neither blocks on the other.
//!
//! ## Transitions
//!
//! `transition` locks the row (`SELECT ... FOR UPDATE`), applies the domain
//! transition in Rust, and writes the result back inside one transaction.
//! The lifecycle rules therefore live in exactly one place (`ChangeRequest::apply`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use safeexec_core::{
    ChangeRequest, ChangeRequestId, ChangeStatus, ChangeType, ChangeValue, TenantId, Transition,
    WorkerId,
};

use super::{ChangeRequestStore, QueueDepth, StoreError};
use crate::pg::{corrupt, map_sqlx_error};

const COLUMNS: &str = r#"
    id, sequence, tenant_id, target_entity_id, entity_type, change_type,
    current_value, requested_value, confidence_score, jitter_min_ms, jitter_max_ms,
    status, earliest_execute_at, claimed_by, claimed_at, executed_at,
    attempt_count, error_message, triggered_by, priority, override_safety,
    needs_verification, created_at, updated_at
"#;

/// Postgres store over the `change_requests` table.
#[derive(Debug, Clone)]
pub struct PostgresChangeRequestStore {
    pool: PgPool,
}

impl PostgresChangeRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeRequestStore for PostgresChangeRequestStore {
    #[instrument(skip(self, request), fields(request_id = %request.id), err)]
    async fn insert(&self, mut request: ChangeRequest) -> Result<ChangeRequest, StoreError> {
        let current_value = serde_json::to_value(request.current_value)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let requested_value = serde_json::to_value(request.requested_value)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO change_requests (
                id, tenant_id, target_entity_id, entity_type, change_type,
                current_value, requested_value, confidence_score, jitter_min_ms, jitter_max_ms,
                status, earliest_execute_at, attempt_count, triggered_by, priority,
                override_safety, needs_verification, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING sequence
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.tenant_id.as_uuid())
        .bind(&request.target_entity_id)
        .bind(request.entity_type.as_str())
        .bind(request.change_type.as_str())
        .bind(current_value)
        .bind(requested_value)
        .bind(request.confidence_score)
        .bind(to_i64("jitter_min_ms", request.jitter_min_ms)?)
        .bind(to_i64("jitter_max_ms", request.jitter_max_ms)?)
        .bind(request.status.as_str())
        .bind(request.earliest_execute_at)
        .bind(request.attempt_count as i32)
        .bind(&request.triggered_by)
        .bind(request.priority)
        .bind(request.override_safety)
        .bind(request.needs_verification)
        .bind(request.created_at)
        .bind(request.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error("insert", e) {
            StoreError::Conflict(_) => StoreError::AlreadyExists(request.id),
            other => other,
        })?;

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| map_sqlx_error("insert", e))?;
        request.sequence = sequence as u64;
        Ok(request)
    }

    async fn get(&self, id: ChangeRequestId) -> Result<Option<ChangeRequest>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM change_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM change_requests
            WHERE status = 'pending' AND earliest_execute_at <= $1
            ORDER BY earliest_execute_at ASC, sequence ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_eligible", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn claim_batch(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id FROM change_requests
                WHERE status = 'pending' AND earliest_execute_at <= $2
                ORDER BY earliest_execute_at ASC, sequence ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE change_requests r
            SET status = 'claimed', claimed_by = $1, claimed_at = $2, updated_at = $2
            FROM claimable c
            WHERE r.id = c.id
            RETURNING {}
            "#,
            prefixed_columns("r")
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id.as_str())
            .bind(now)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|r| (r.earliest_execute_at, r.sequence));
        Ok(claimed)
    }

    #[instrument(skip(self, transition), fields(request_id = %id, to = %transition.to), err)]
    async fn transition(
        &self,
        id: ChangeRequestId,
        transition: &Transition,
    ) -> Result<ChangeRequest, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;

        let sql = format!("SELECT {COLUMNS} FROM change_requests WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("transition", e))?
            .ok_or(StoreError::NotFound(id))?;

        let mut request = decode_row(&row)?;
        request.apply(transition)?;

        let updated = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = $2,
                earliest_execute_at = $3,
                claimed_by = $4,
                claimed_at = $5,
                executed_at = $6,
                attempt_count = $7,
                error_message = $8,
                needs_verification = $9,
                updated_at = $10
            WHERE id = $1
              AND status = $11
              AND ($12::text IS NULL OR claimed_by = $12)
            "#,
        )
        .bind(id.as_uuid())
        .bind(request.status.as_str())
        .bind(request.earliest_execute_at)
        .bind(request.claimed_by.as_ref().map(WorkerId::as_str))
        .bind(request.claimed_at)
        .bind(request.executed_at)
        .bind(request.attempt_count as i32)
        .bind(&request.error_message)
        .bind(request.needs_verification)
        .bind(request.updated_at)
        .bind(transition.from.as_str())
        .bind(expected_owner(transition).map(WorkerId::as_str))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "request {id} changed underneath a {} -> {} transition",
                transition.from, transition.to
            )));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;

        Ok(request)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        // SET expressions see the pre-update row, so claimed_by still names the old owner.
        let sql = format!(
            r#"
            WITH stale AS (
                SELECT id FROM change_requests
                WHERE status = 'claimed' AND claimed_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE change_requests r
            SET status = 'pending',
                error_message = 'claim abandoned by ' || COALESCE(r.claimed_by, 'unknown worker'),
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $2
            FROM stale s
            WHERE r.id = s.id
            RETURNING {}
            "#,
            prefixed_columns("r")
        );
        let rows = sqlx::query(&sql)
            .bind(claimed_before)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut released = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        released.sort_by_key(|r| r.sequence);
        Ok(released)
    }

    async fn find_overdue(
        &self,
        change_type: ChangeType,
        created_before: DateTime<Utc>,
        stale_claim_before: DateTime<Utc>,
    ) -> Result<Vec<ChangeRequest>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM change_requests
            WHERE change_type = $1
              AND created_at < $2
              AND (
                status = 'pending'
                OR (status IN ('claimed', 'executing') AND claimed_at < $3)
              )
            ORDER BY sequence ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(change_type.as_str())
            .bind(created_before)
            .bind(stale_claim_before)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_overdue", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn count_by_status(&self, tenant_id: Option<TenantId>) -> Result<QueueDepth, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM change_requests
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status
            "#,
        )
        .bind(tenant_id.map(Uuid::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("count_by_status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_by_status", e))?;
            let status = status.parse::<ChangeStatus>().map_err(|e| corrupt("status", e))?;
            depth.add(status, n as u64);
        }
        Ok(depth)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM change_requests
            WHERE status IN ('completed', 'failed', 'blocked', 'expired', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal_before", e))?;

        Ok(result.rows_affected())
    }
}

fn to_i64(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Storage(format!("{column} out of range: {value}")))
}

/// Owner a transition out of `claimed` must still match.
fn expected_owner(transition: &Transition) -> Option<&WorkerId> {
    if transition.from == ChangeStatus::Claimed {
        transition.worker_id.as_ref()
    } else {
        None
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_value(row: &sqlx::postgres::PgRow, column: &str) -> Result<ChangeValue, StoreError> {
    let json: serde_json::Value = row.try_get(column).map_err(|e| map_sqlx_error("decode", e))?;
    serde_json::from_value(json).map_err(|e| corrupt(column, e))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<ChangeRequest, StoreError> {
    let get_err = |e| map_sqlx_error("decode", e);

    let id: Uuid = row.try_get("id").map_err(get_err)?;
    let sequence: i64 = row.try_get("sequence").map_err(get_err)?;
    let tenant_id: Uuid = row.try_get("tenant_id").map_err(get_err)?;
    let entity_type: String = row.try_get("entity_type").map_err(get_err)?;
    let change_type: String = row.try_get("change_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let jitter_min_ms: i64 = row.try_get("jitter_min_ms").map_err(get_err)?;
    let jitter_max_ms: i64 = row.try_get("jitter_max_ms").map_err(get_err)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(get_err)?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(get_err)?;

    Ok(ChangeRequest {
        id: ChangeRequestId::from_uuid(id),
        sequence: sequence as u64,
        tenant_id: TenantId::from_uuid(tenant_id),
        target_entity_id: row.try_get("target_entity_id").map_err(get_err)?,
        entity_type: entity_type.parse().map_err(|e| corrupt("entity_type", e))?,
        change_type: change_type.parse().map_err(|e| corrupt("change_type", e))?,
        current_value: decode_value(row, "current_value")?,
        requested_value: decode_value(row, "requested_value")?,
        confidence_score: row.try_get("confidence_score").map_err(get_err)?,
        jitter_min_ms: jitter_min_ms as u64,
        jitter_max_ms: jitter_max_ms as u64,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        earliest_execute_at: row.try_get("earliest_execute_at").map_err(get_err)?,
        claimed_by: claimed_by.map(WorkerId::new),
        claimed_at: row.try_get("claimed_at").map_err(get_err)?,
        executed_at: row.try_get("executed_at").map_err(get_err)?,
        attempt_count: attempt_count as u32,
        error_message: row.try_get("error_message").map_err(get_err)?,
        triggered_by: row.try_get("triggered_by").map_err(get_err)?,
        priority: row.try_get("priority").map_err(get_err)?,
        override_safety: row.try_get("override_safety").map_err(get_err)?,
        needs_verification: row.try_get("needs_verification").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_clause_qualifies_every_column() {
        let cols = prefixed_columns("r");
        assert!(cols.starts_with("r.id, r.sequence"));
        assert!(cols.ends_with("r.updated_at"));
        assert_eq!(cols.matches("r.").count(), COLUMNS.split(',').count());
    }
}
