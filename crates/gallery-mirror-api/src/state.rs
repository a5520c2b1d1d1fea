//! The published index snapshot, swapped atomically after every sync pass.

use std::sync::{Arc, RwLock};

use gallery_mirror_query::StoreIndex;
use gallery_mirror_store::FileStore;
use gallery_mirror_types::Result;

/// A handle to the live snapshot pointer.
/// Readers clone the `Arc` out from under a brief read lock and then hold
/// their own reference for the rest of the request; a writer never blocks
/// a reader and a reader never sees a half-built snapshot.
#[derive(Clone)]
pub struct IndexHandle {
    inner: Arc<RwLock<Arc<StoreIndex>>>,
}

impl IndexHandle {
    pub fn new(index: StoreIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<StoreIndex> {
        self.inner.read().expect("index lock poisoned").clone()
    }

    /// Rebuild from disk and swap the published pointer. The old snapshot
    /// stays valid for any reader that grabbed it before the swap.
    pub async fn refresh(&self, store: &FileStore) -> Result<()> {
        let fresh = StoreIndex::load(store).await?;
        *self.inner.write().expect("index lock poisoned") = Arc::new(fresh);
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub index: IndexHandle,
    pub store: Arc<FileStore>,
    /// Externally reachable base URL this process is served behind, used to
    /// build absolute asset URIs and update-manifest download links.
    pub base_url: String,
}
