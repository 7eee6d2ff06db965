use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use bulwark_infra::jobs::QueueError;
use bulwark_infra::quota::QuotaError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::UnregisteredKind(kind) => json_error(
            StatusCode::BAD_REQUEST,
            "unregistered_kind",
            format!("no handler registered for job kind {kind}"),
        ),
        QueueError::InvalidPriority(p) => json_error(
            StatusCode::BAD_REQUEST,
            "invalid_priority",
            format!("priority {p} must be between 1 and 10"),
        ),
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        e @ QueueError::NotCancellable { .. } => {
            json_error(StatusCode::CONFLICT, "not_cancellable", e.to_string())
        }
        e @ QueueError::ClaimLost(_) => {
            json_error(StatusCode::CONFLICT, "claim_lost", e.to_string())
        }
        QueueError::Store(e) => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "job store unavailable")
        }
    }
}

pub fn quota_error_to_response(err: QuotaError) -> axum::response::Response {
    tracing::error!(error = %err, "quota store error");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "quota_unavailable", "quota store unavailable")
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
