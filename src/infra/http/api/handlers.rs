use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::application::export::InFlightExport;
use crate::domain::export::{ExportRequest, UserId};
use crate::infra::http::HttpState;

use super::error::ApiError;
use super::models::ExportResponse;

/// `POST /api/export-as-pdf`
///
/// Authenticates inside the export pipeline so validation errors are reported
/// first; the resolved caller is attached to the response for logging.
pub async fn export_as_pdf(
    State(state): State<HttpState>,
    headers: HeaderMap,
    payload: Result<Json<ExportRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return ApiError::malformed_body(rejection).into_response(),
    };

    let (user, result) = state.exports.export_identified(&request, &headers).await;
    let mut response = match result {
        Ok(outcome) => Json(ExportResponse::published(outcome.location.signed_url)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    };
    if let Some(user) = user {
        response.extensions_mut().insert(user);
    }
    response
}

/// `GET /api/exports/in-flight`, limited to the caller's own exports.
pub async fn list_in_flight(
    State(state): State<HttpState>,
    Extension(user): Extension<UserId>,
) -> Json<Vec<InFlightExport>> {
    let exports = state
        .exports
        .in_flight()
        .snapshot()
        .into_iter()
        .filter(|export| export.user_id == user.as_str())
        .collect();
    Json(exports)
}
