use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::infra::http::HttpState;

use super::error::ApiError;

/// Resolve the caller before the handler runs and expose it as an extension.
pub async fn require_identity(
    State(state): State<HttpState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let user = match state.exports.authenticate(request.headers()).await {
        Ok(user) => user,
        Err(err) => return ApiError::from(err).into_response(),
    };

    request.extensions_mut().insert(user.clone());
    let mut response = next.run(request).await;
    response.extensions_mut().insert(user);
    response
}
