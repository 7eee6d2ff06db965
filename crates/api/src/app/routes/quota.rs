use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use bulwark_infra::AppContext;

use crate::app::errors;
use crate::context::CallerContext;

pub fn router() -> Router {
    Router::new().route("/", get(get_quota))
}

pub async fn get_quota(
    Extension(ctx): Extension<AppContext>,
    Extension(caller): Extension<CallerContext>,
) -> axum::response::Response {
    match ctx.ledger.snapshot(caller.caller_id()).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "no quota record"),
        Err(e) => errors::quota_error_to_response(e),
    }
}
