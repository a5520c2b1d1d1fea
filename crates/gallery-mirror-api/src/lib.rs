//! The Gallery API: the HTTP surface an editor client talks to
//! in place of the real update feed and extension marketplace.
//!
//! Every handler answers out of a single published [`state::IndexHandle`]
//! snapshot — nothing on the read path
//! ever touches the filesystem to decide whether something exists, only to
//! stream bytes once a snapshot has already said they do. [`IndexHandle`]
//! is also what `gallery-mirror-cli`'s `serve`/`watch` loop calls into
//! after each sync pass to publish a fresh snapshot.

mod assets;
mod binaries;
mod commit;
mod error;
mod extensionquery;
mod mime;
mod root;
mod state;
mod stats;
mod stream;
mod update;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gallery_mirror_query::StoreIndex;
use gallery_mirror_store::FileStore;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::{AppState, IndexHandle};

/// Assemble the router over an already-loaded snapshot. Returns the
/// [`IndexHandle`] alongside the router so the caller can refresh it on its
/// own schedule (after a sync pass, or on a fixed interval under `watch`).
pub fn build_router(store: Arc<FileStore>, index: StoreIndex, base_url: impl Into<String>) -> (Router, IndexHandle) {
    let handle = IndexHandle::new(index);
    let state = AppState {
        index: handle.clone(),
        store,
        base_url: base_url.into(),
    };

    let router = Router::new()
        .route("/", get(root::liveness))
        .route("/extensionquery", post(extensionquery::extension_query))
        .route("/assets/:publisher/:name/:version/:asset_type", get(assets::get_asset))
        .route("/api/update/:platform/:quality/:commit", get(update::update_check))
        .route(
            "/binaries/:quality/:platform/:commit/:filename",
            get(binaries::get_binary),
        )
        .route("/:commit_segment/:platform/:quality", get(commit::binary_redirect))
        .route("/stats", post(stats::record_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    (router, handle)
}
