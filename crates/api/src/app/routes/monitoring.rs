//! Read-only operator endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/queue-depth", get(queue_depth))
        .route("/rate-limit-status", get(rate_limit_status))
        .route("/failures", get(recent_failures))
        .route("/entities/:entity_id/budget-history", get(budget_history))
}

pub async fn queue_depth(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::QueueDepthQuery>,
) -> axum::response::Response {
    match services.monitor.queue_depth(query.tenant_id).await {
        Ok(depth) => Json(serde_json::json!({
            "tenant_id": query.tenant_id,
            "in_flight": depth.in_flight(),
            "by_status": depth,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn rate_limit_status(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RateLimitQuery>,
) -> axum::response::Response {
    match services.monitor.rate_limit_status(query.tenant_id, query.change_type).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn recent_failures(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::FailuresQuery>,
) -> axum::response::Response {
    let since = query
        .since
        .unwrap_or_else(|| services.clock.now() - chrono::Duration::hours(24));

    match services.monitor.recent_failures(query.tenant_id, since).await {
        Ok(records) => Json(serde_json::json!({
            "since": since,
            "count": records.len(),
            "records": records,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn budget_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(entity_id): Path<String>,
    Query(query): Query<dto::BudgetHistoryQuery>,
) -> axum::response::Response {
    let window = Duration::from_secs(query.window_hours.saturating_mul(3_600));

    match services
        .monitor
        .budget_change_history(query.tenant_id, &entity_id, window)
        .await
    {
        Ok(records) => Json(serde_json::json!({
            "entity_id": entity_id,
            "window_hours": query.window_hours,
            "as_of": services.clock.now(),
            "records": records,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
