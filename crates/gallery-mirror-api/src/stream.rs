//! Streams a file out of the store, honoring a single-range `Range` header.
//! Multi-range requests are answered with the full body rather than a `multipart/
//! byteranges` response — no client this mirror serves sends one.

use std::io::SeekFrom;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::state::AppState;

struct ByteRange {
    start: u64,
    end: u64,
}

fn parse_range(header_value: &str, total_len: u64) -> Option<ByteRange> {
    let spec = header_value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        let start = total_len.saturating_sub(suffix_len);
        return Some(ByteRange {
            start,
            end: total_len.saturating_sub(1),
        });
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        total_len.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if total_len == 0 || start > end || end >= total_len {
        return None;
    }
    Some(ByteRange { start, end })
}

pub async fn serve_file(
    state: &AppState,
    relpath: &str,
    content_type: &'static str,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(state.store.full_path(relpath))
        .await
        .map_err(|_| ApiError(gallery_mirror_types::Error::NotFound(relpath.to_string())))?;
    let total_len = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total_len));

    let mut file = state.store.open_read(relpath).await?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");

    let body = if let Some(range) = range {
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(gallery_mirror_types::Error::StoreIo)?;
        let len = range.end - range.start + 1;
        builder = builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, total_len),
            )
            .header(header::CONTENT_LENGTH, len.to_string());
        Body::from_stream(ReaderStream::new(file.take(len)))
    } else {
        builder = builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total_len.to_string());
        Body::from_stream(ReaderStream::new(file))
    };

    Ok(builder.body(body).expect("response builder is well-formed"))
}
