use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::export::ExportError;

const SOURCE: &str = "infra::http::api";

/// Wire shape of every failed API call.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    report: ErrorReport,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn malformed_body(rejection: JsonRejection) -> Self {
        let status = StatusCode::BAD_REQUEST;
        Self {
            status,
            code: "validation_error",
            message: "Request body must be a JSON object".to_string(),
            report: ErrorReport::from_error(SOURCE, status, &rejection),
        }
    }
}

/// HTTP status for each export failure kind.
pub fn status_for(error: &ExportError) -> StatusCode {
    match error {
        ExportError::Validation { .. } => StatusCode::BAD_REQUEST,
        ExportError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        ExportError::Navigation { .. } | ExportError::Upload(_) | ExportError::Sign(_) => {
            StatusCode::BAD_GATEWAY
        }
        ExportError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ExportError::Configuration { .. }
        | ExportError::Capture { .. }
        | ExportError::Render { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ExportError> for ApiError {
    fn from(error: ExportError) -> Self {
        let status = status_for(&error);
        Self {
            status,
            code: error.kind(),
            message: error.public_message(),
            report: ErrorReport::from_error(SOURCE, status, &error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message,
            code: self.code,
        };
        let mut response = (self.status, Json(body)).into_response();
        // The full chain stays server-side for the response logger.
        self.report.attach(&mut response);
        response
    }
}
