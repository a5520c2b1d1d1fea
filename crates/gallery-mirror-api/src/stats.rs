//! `POST /stats`: a telemetry beacon this mirror has no
//! collector for. Accepted and discarded unconditionally so the editor
//! client never sees a failure it would retry.

use axum::body::Bytes;
use axum::http::StatusCode;

pub async fn record_stats(_body: Bytes) -> StatusCode {
    StatusCode::OK
}
