use axum::Router;

pub mod jobs;
pub mod quota;
pub mod system;

/// Router for every caller-scoped endpoint (behind admission).
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/quota", quota::router())
}
