//! `GET /assets/{publisher}/{name}/{version}/{assetType}`: streams one
//! file belonging to a published extension version.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use gallery_mirror_types::Error;
use serde::Deserialize;

use crate::error::ApiError;
use crate::mime::content_type_for_asset;
use crate::state::AppState;
use crate::stream::serve_file;

#[derive(Debug, Default, Deserialize)]
pub struct AssetQuery {
    #[serde(default, rename = "targetPlatform")]
    target_platform: Option<String>,
}

pub async fn get_asset(
    State(state): State<AppState>,
    Path((publisher, name, version, asset_type)): Path<(String, String, String, String)>,
    Query(query): Query<AssetQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identifier = format!("{publisher}.{name}");
    let snapshot = state.index.snapshot();

    let record = snapshot
        .get(&identifier)
        .ok_or_else(|| Error::NotFound(format!("extension {identifier} not found")))?;
    let version_entry = record
        .version(&version, query.target_platform.as_deref())
        .ok_or_else(|| Error::NotFound(format!("{identifier}@{version} not found")))?;
    let asset = version_entry
        .asset(&asset_type)
        .ok_or_else(|| Error::NotFound(format!("{identifier}@{version} has no asset {asset_type}")))?;

    let relpath = format!(
        "extensions/{}/{}/{}",
        record.identifier.key(),
        version_entry.dir_relpath(),
        asset.path
    );

    serve_file(&state, &relpath, content_type_for_asset(&asset_type), headers).await
}
