use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use bulwark_core::JobId;
use bulwark_infra::cache::TierFlags;
use bulwark_infra::jobs::{Job, JobFilter};
use bulwark_infra::AppContext;

use crate::app::{dto, errors};
use crate::context::CallerContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job).get(list_jobs))
        .route("/:id", get(get_job).delete(cancel_job))
}

pub async fn enqueue_job(
    Extension(ctx): Extension<AppContext>,
    Extension(caller): Extension<CallerContext>,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    let kind = match dto::parse_kind(&body.kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    if let Some(key) = body.cache_key.as_deref() {
        if let Some(value) = ctx.cache.get(key, TierFlags::ALL).await {
            info!(caller_id = %caller.caller_id(), cache_key = key, "served from cache");
            return Json(dto::CachedResultResponse { cached: true, value }).into_response();
        }
    }

    let opts = body
        .options()
        .caller(caller.caller_id().clone())
        .correlation(caller.correlation_id());

    match ctx.queue.enqueue(kind, body.payload, opts).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(ctx): Extension<AppContext>,
    Extension(caller): Extension<CallerContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let mut filter = JobFilter {
        caller_id: Some(caller.caller_id().clone()),
        ..JobFilter::default()
    };
    if let Some(kind) = query.kind.as_deref() {
        match dto::parse_kind(kind) {
            Ok(k) => filter.kind = Some(k),
            Err(resp) => return resp,
        }
    }
    if let Some(status) = query.status.as_deref() {
        match dto::parse_status(status) {
            Ok(s) => filter.statuses.push(s),
            Err(resp) => return resp,
        }
    }
    if let Some(limit) = query.limit {
        filter.limit = limit.clamp(1, 500);
    }

    let stats = match ctx.queue.stats().await {
        Ok(s) => s,
        Err(e) => return errors::queue_error_to_response(e),
    };
    match ctx.queue.list(&filter).await {
        Ok(jobs) => Json(dto::JobListResponse { stats, jobs }).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(ctx): Extension<AppContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match owned_job(&ctx, &caller, &id).await {
        Ok(job) => Json(job).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cancel_job(
    Extension(ctx): Extension<AppContext>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job = match owned_job(&ctx, &caller, &id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    match ctx.queue.cancel(job.id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// Load a job, hiding jobs submitted by other callers.
async fn owned_job(
    ctx: &AppContext,
    caller: &CallerContext,
    id: &str,
) -> Result<Job, axum::response::Response> {
    let id: JobId = id
        .parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))?;
    let job = ctx
        .queue
        .get(id)
        .await
        .map_err(errors::queue_error_to_response)?
        .ok_or_else(|| errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found"))?;

    if job.metadata.caller_id.as_ref() != Some(caller.caller_id()) {
        return Err(errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found"));
    }
    Ok(job)
}
