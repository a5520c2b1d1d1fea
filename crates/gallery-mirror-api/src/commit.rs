//! `GET /commit:{commit}/{platform}/{quality}`: binary download redirect.
//! Axum's router can't match a literal prefix fused onto a path
//! parameter in the same segment, so the whole first segment is captured
//! and the `commit:` prefix is peeled off by hand.
//!
//! This mirror redirects to its own [`crate::binaries`] route rather than
//! to the upstream CDN URL recorded on the release, so a fully offline
//! deployment can still serve the download.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Redirect, Response};
use gallery_mirror_types::{Error, Quality};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn binary_redirect(
    State(state): State<AppState>,
    Path((commit_segment, platform, quality)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let commit = commit_segment
        .strip_prefix("commit:")
        .ok_or_else(|| Error::NotFound(format!("{commit_segment} is not a commit path")))?;
    let quality: Quality = quality.parse()?;

    let snapshot = state.index.snapshot();
    let release = snapshot
        .binaries
        .iter()
        .find(|r| r.platform == platform && r.quality == quality && r.commit == commit)
        .ok_or_else(|| Error::NotFound(format!("no release for {platform}/{quality}/{commit}")))?;

    let filename = release.url.rsplit('/').next().unwrap_or("download");
    let target = format!("/{}", release.relpath(filename));
    Ok(Redirect::temporary(&target).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use gallery_mirror_query::StoreIndex;
    use gallery_mirror_store::FileStore;
    use gallery_mirror_types::BinaryRelease;

    fn state_with_release() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let release = BinaryRelease {
            platform: "linux-x64".to_string(),
            quality: Quality::Stable,
            commit: "abc123".to_string(),
            version: "1.90.0".to_string(),
            url: "https://update.example.com/files/vscode-linux-x64.tar.gz".to_string(),
            hash: None,
            size: 1000,
            timestamp: Utc::now(),
            extra: Default::default(),
        };
        let index = StoreIndex {
            extensions: Default::default(),
            binaries: vec![release],
            recommendations: Default::default(),
            malicious: Default::default(),
        };
        AppState {
            index: crate::state::IndexHandle::new(index),
            store: Arc::new(FileStore::new(dir.keep())),
            base_url: "https://mirror.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn redirects_to_the_locally_mirrored_binary_path() {
        let state = state_with_release();
        let response = binary_redirect(
            State(state),
            Path((
                "commit:abc123".to_string(),
                "linux-x64".to_string(),
                "stable".to_string(),
            )),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::TEMPORARY_REDIRECT);
        let location = response
            .headers()
            .get(axum::http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(location, "/binaries/stable/linux-x64/abc123/vscode-linux-x64.tar.gz");
    }

    #[tokio::test]
    async fn unknown_commit_is_a_404() {
        let state = state_with_release();
        let error = binary_redirect(
            State(state),
            Path((
                "commit:deadbeef".to_string(),
                "linux-x64".to_string(),
                "stable".to_string(),
            )),
        )
        .await
        .unwrap_err();
        assert!(matches!(error.0, Error::NotFound(_)));
    }
}
