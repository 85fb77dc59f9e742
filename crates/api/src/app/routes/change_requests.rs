use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use safeexec_core::NewChangeRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue))
        .route("/:id", get(get_request))
        .route("/:id/cancel", post(cancel))
        .route("/:id/history", get(history))
}

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateChangeRequest>,
) -> axum::response::Response {
    match services.executor.enqueue(NewChangeRequest::from(body)).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(e) => errors::enqueue_error_to_response(e),
    }
}

pub async fn get_request(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_request_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.executor.get(id).await {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_request_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.executor.cancel(id).await {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_request_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.executor.history(id).await {
        Ok(records) => Json(serde_json::json!({
            "id": id,
            "records": records,
        }))
        .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
