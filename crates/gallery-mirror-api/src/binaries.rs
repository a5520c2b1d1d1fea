//! `GET /binaries/{quality}/{platform}/{commit}/{filename}`: streams a
//! mirrored editor build. Not part of the upstream-compatible surface;
//! [`crate::commit`] redirects here instead of to the upstream CDN so the
//! mirror stays usable offline.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use crate::error::ApiError;
use crate::mime::content_type_for_binary;
use crate::state::AppState;
use crate::stream::serve_file;

pub async fn get_binary(
    State(state): State<AppState>,
    Path((quality, platform, commit, filename)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let relpath = format!("binaries/{quality}/{platform}/{commit}/{filename}");
    serve_file(&state, &relpath, content_type_for_binary(&filename), headers).await
}
