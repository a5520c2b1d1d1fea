//! Maps the shared error taxonomy onto HTTP status codes: `NotFound` ->
//! 404, `RequestMalformed` -> 400, everything else -> 500
//! with the underlying detail redacted from the response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gallery_mirror_types::Error;
use serde_json::json;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::RequestMalformed(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            other => {
                tracing::error!(error = %other, "internal error serving gallery API request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}
