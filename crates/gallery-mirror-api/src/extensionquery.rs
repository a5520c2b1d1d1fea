//! `POST /extensionquery`: runs the decoded filter groups
//! against the published snapshot and, when the request asked for asset
//! URIs, rewrites each asset's on-disk-relative path into an absolute
//! `/assets/...` URL this process can serve.

use axum::Json;
use axum::extract::State;
use gallery_mirror_query::ExtensionQueryResult;

use crate::state::AppState;

pub async fn extension_query(
    State(state): State<AppState>,
    Json(request): Json<gallery_mirror_query::ExtensionQueryRequest>,
) -> Json<ExtensionQueryResult> {
    let snapshot = state.index.snapshot();
    let mut result = snapshot.execute(&request);
    if request.flags.include_asset_uri {
        rewrite_asset_uris(&state.base_url, &mut result);
    }
    Json(result)
}

fn rewrite_asset_uris(base_url: &str, result: &mut ExtensionQueryResult) {
    for page in &mut result.results {
        for item in &mut page.extensions {
            let publisher = item.publisher.publisher_name.clone();
            let name = item.extension_name.clone();
            for version in &mut item.versions {
                let version_str = version.version.clone();
                for asset in &mut version.assets {
                    asset.path = format!(
                        "{base_url}/assets/{publisher}/{name}/{version_str}/{}",
                        asset.asset_type
                    );
                }
            }
        }
    }
}
