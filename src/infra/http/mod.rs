//! HTTP surface: the export endpoint plus health and in-flight introspection.

pub mod api;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::export::ExportService;

pub use api::error::{ApiError, ApiErrorBody};
pub use middleware::RequestContext;

#[derive(Clone)]
pub struct HttpState {
    pub exports: Arc<ExportService>,
}

impl HttpState {
    pub fn new(exports: ExportService) -> Self {
        Self {
            exports: Arc::new(exports),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api::build_api_router(state.clone()))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
