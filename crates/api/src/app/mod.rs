//! HTTP application wiring (Axum router).
//!
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use bulwark_infra::AppContext;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(ctx: AppContext) -> Router {
    let admission_state = middleware::AdmissionState {
        ledger: ctx.ledger.clone(),
        clock: ctx.clock.clone(),
    };

    // Caller-scoped routes: require a caller id and pass admission.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        admission_state,
        middleware::admission_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(ctx)))
}
