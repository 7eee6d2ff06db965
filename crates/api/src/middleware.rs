use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use tracing::warn;

use bulwark_core::{CallerId, CorrelationId, SharedClock};
use bulwark_infra::quota::{Admission, DenyReason, QuotaLedger};

use crate::app::errors::json_error;
use crate::context::CallerContext;

pub const CALLER_HEADER: &str = "x-caller-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Clone)]
pub struct AdmissionState {
    pub ledger: Arc<QuotaLedger>,
    pub clock: SharedClock,
}

/// Identify the caller, run quota admission, and release the concurrency
/// slot once the response is produced.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let caller = match extract_caller(req.headers()) {
        Ok(caller) => caller,
        Err(message) => return json_error(StatusCode::UNAUTHORIZED, "missing_caller", message),
    };
    let correlation_id = extract_correlation(req.headers());

    let admission = state.ledger.check_admission(&caller).await;
    if !admission.allowed {
        return denied_response(&admission, state.clock.now());
    }

    req.extensions_mut()
        .insert(CallerContext::new(caller.clone(), correlation_id));
    let mut res = next.run(req).await;

    if admission.slot_reserved {
        if let Err(e) = state.ledger.complete_request(&caller).await {
            warn!(caller_id = %caller, error = %e, "failed to release concurrency slot");
        }
    }

    apply_rate_limit_headers(res.headers_mut(), &admission);
    res
}

fn extract_caller(headers: &HeaderMap) -> Result<CallerId, &'static str> {
    let value = headers
        .get(CALLER_HEADER)
        .ok_or("x-caller-id header is required")?;
    let value = value
        .to_str()
        .map_err(|_| "x-caller-id must be visible ASCII")?
        .trim();
    if value.is_empty() {
        return Err("x-caller-id must not be empty");
    }
    Ok(CallerId::new(value))
}

fn extract_correlation(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn status_for(reason: Option<DenyReason>) -> StatusCode {
    match reason {
        Some(DenyReason::Blocked) => StatusCode::FORBIDDEN,
        Some(DenyReason::QuotaUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn denied_response(admission: &Admission, now: DateTime<Utc>) -> Response {
    let mut res = (status_for(admission.reason), Json(admission)).into_response();
    let headers = res.headers_mut();
    apply_rate_limit_headers(headers, admission);

    if let Some(until) = admission.block_until.or(admission.reset_at) {
        let secs = (until - now).num_seconds().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(axum::http::header::RETRY_AFTER, value);
        }
    }
    res
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    let daily = &admission.quotas.daily;
    if daily.limit == 0 {
        return;
    }
    headers.insert(LIMIT_HEADER, HeaderValue::from(daily.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(daily.limit.saturating_sub(daily.used)));
    if let Some(reset_at) = admission.reset_at {
        headers.insert(RESET_HEADER, HeaderValue::from(reset_at.timestamp().max(0)));
    }
}
