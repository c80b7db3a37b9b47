pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::infra::http::HttpState;

pub fn build_api_router(state: HttpState) -> Router<HttpState> {
    // The export route authenticates inside the pipeline, after validation.
    let authenticated = Router::new()
        .route("/api/exports/in-flight", get(handlers::list_in_flight))
        .route_layer(axum_middleware::from_fn_with_state(
            state,
            middleware::require_identity,
        ));

    Router::new()
        .route("/api/export-as-pdf", post(handlers::export_as_pdf))
        .merge(authenticated)
}
