//! Shared Postgres helpers.

use crate::store::StoreError;

/// Map a SQLx error onto the storage error taxonomy.
///
/// | SQLx Error | PostgreSQL Error Code | StoreError |
/// |------------|----------------------|------------|
/// | Database (unique violation) | `23505` | `Conflict` |
/// | Database (serialization failure) | `40001` | `Conflict` |
/// | Database (check constraint violation) | `23514` | `Storage` |
/// | Database (other) | Any other | `Storage` |
/// | PoolClosed / RowNotFound / other | N/A | `Storage` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Error for a persisted value that no longer parses.
pub(crate) fn corrupt(column: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("corrupt {column} column: {err}"))
}
