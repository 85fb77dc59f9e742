use axum::Router;

pub mod change_requests;
pub mod monitoring;
pub mod system;

/// Router for every service endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/change-requests", change_requests::router())
        .merge(monitoring::router())
}
