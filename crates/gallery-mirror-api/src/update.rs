//! `GET /api/update/{platform}/{quality}/{commit}`:
//! 200 with a manifest when a newer build exists, 204 when the caller is
//! already current or no release for the channel has been mirrored yet.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gallery_mirror_types::Quality;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// The wire shape the editor's update client expects: camelCase, and a
/// couple of fields `BinaryRelease` doesn't track because nothing else
/// in this mirror needs them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateManifest {
    url: String,
    name: String,
    version: String,
    product_version: String,
    hash: Option<String>,
    timestamp: i64,
    sha256hash: Option<String>,
}

pub async fn update_check(
    State(state): State<AppState>,
    Path((platform, quality, commit)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let quality: Quality = quality.parse()?;
    let snapshot = state.index.snapshot();

    let Some(release) = snapshot.latest_binary(&platform, quality) else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    if release.commit == commit {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let manifest = UpdateManifest {
        url: format!("{}/commit:{}/{platform}/{quality}", state.base_url, release.commit),
        name: format!("{platform}-{quality}-{}", release.commit),
        version: release.version.clone(),
        product_version: release.version.clone(),
        hash: release.hash.clone(),
        timestamp: release.timestamp.timestamp(),
        sha256hash: release.hash.clone(),
    };
    Ok(Json(manifest).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use gallery_mirror_query::StoreIndex;
    use gallery_mirror_store::FileStore;
    use gallery_mirror_types::BinaryRelease;

    fn state_with_release(commit: &str) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let release = BinaryRelease {
            platform: "linux-x64".to_string(),
            quality: Quality::Stable,
            commit: commit.to_string(),
            version: "1.90.0".to_string(),
            url: "https://update.example.com/files/vscode.tar.gz".to_string(),
            hash: Some("deadbeef".to_string()),
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
    async fn returns_a_manifest_when_a_newer_build_is_mirrored() {
        let state = state_with_release("new-commit");
        let response = update_check(
            State(state),
            Path(("linux-x64".to_string(), "stable".to_string(), "old-commit".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn returns_204_when_the_caller_is_already_current() {
        let state = state_with_release("same-commit");
        let response = update_check(
            State(state),
            Path(("linux-x64".to_string(), "stable".to_string(), "same-commit".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn returns_204_when_no_release_is_mirrored_for_the_channel() {
        let state = state_with_release("whatever");
        let response = update_check(
            State(state),
            Path(("darwin-arm64".to_string(), "stable".to_string(), "x".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
