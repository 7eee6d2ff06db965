use axum::{extract::Extension, response::IntoResponse, Json};
use serde_json::json;

use bulwark_infra::AppContext;

/// Liveness plus breaker and shared-cache state. Not quota-checked.
pub async fn health(Extension(ctx): Extension<AppContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "breakers": ctx.breakers.snapshot(),
        "shared_cache": ctx.cache.shared_state(),
        "cache": ctx.cache.stats(),
    }))
}
