//! A bounded-concurrency pool that turns resolved [`WorkItem`]s into bytes
//! on disk.
//!
//! Each item is downloaded independently: a failure isolates to its own
//! item rather than aborting the pass, and an item whose
//! destination already matches its declared size/hash is skipped without
//! touching the network. Concurrency is capped with a [`Semaphore`] and
//! tasks run on a [`JoinSet`](tokio::task::JoinSet) so the process can keep
//! serving HTTP requests on the same runtime while a sync pass downloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use gallery_mirror_retry::{calculate_delay, ErrorClass, RetryStrategyConfig};
use gallery_mirror_store::{Expectation, FileStore};
use gallery_mirror_types::{Error, Result, WorkItem};
use gallery_mirror_upstream::UpstreamClient;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Live counters for an in-progress or just-finished pass.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped_existing: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// A point-in-time read of [`ProgressCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped_existing: u64,
    pub bytes_written: u64,
}

impl ProgressCounters {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_existing: self.skipped_existing.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// The outcome of downloading one work item.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub item: WorkItem,
    pub error: Option<Error>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Bounded-concurrency downloader over a [`FileStore`] and [`UpstreamClient`].
pub struct DownloadPool {
    store: Arc<FileStore>,
    client: Arc<UpstreamClient>,
    concurrency: usize,
    retry: RetryStrategyConfig,
}

impl DownloadPool {
    pub fn new(
        store: Arc<FileStore>,
        client: Arc<UpstreamClient>,
        concurrency: usize,
        retry: RetryStrategyConfig,
    ) -> Self {
        Self {
            store,
            client,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Download every item, honoring `cancel`. Returns once all items have
    /// either finished, failed, or observed cancellation.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        progress: Arc<ProgressCounters>,
        cancel: CancellationToken,
    ) -> Vec<DownloadOutcome> {
        progress.total.fetch_add(items.len() as u64, Ordering::Relaxed);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = tokio::task::JoinSet::new();

        for item in items {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                continue;
            };
            let store = self.store.clone();
            let client = self.client.clone();
            let retry = self.retry.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;

                let result = if cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    tokio::select! {
                        result = download_with_retry(&store, &client, &item, &retry) => result,
                        () = cancel.cancelled() => Err(Error::Cancelled),
                    }
                };

                match &result {
                    Ok(DownloadResult::AlreadyPresent) => {
                        progress.completed.fetch_add(1, Ordering::Relaxed);
                        progress.skipped_existing.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(DownloadResult::Fetched { bytes }) => {
                        progress.completed.fetch_add(1, Ordering::Relaxed);
                        progress.bytes_written.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    Err(e) => {
                        progress.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(group = %item.group, path = %item.dest_relpath, error = %e, "download failed");
                    }
                }

                DownloadOutcome {
                    item,
                    error: result.err(),
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => warn!(error = %join_error, "download task panicked"),
            }
        }
        outcomes
    }
}

enum DownloadResult {
    AlreadyPresent,
    Fetched { bytes: u64 },
}

async fn download_with_retry(
    store: &FileStore,
    client: &UpstreamClient,
    item: &WorkItem,
    retry: &RetryStrategyConfig,
) -> Result<DownloadResult> {
    let expect = Expectation {
        size: item.declared_size,
        hash: item.declared_hash.clone(),
    };

    if store.has(&item.dest_relpath, Some(&expect)).await? {
        return Ok(DownloadResult::AlreadyPresent);
    }

    let mut attempt = 1;
    loop {
        match download_once(store, client, item, &expect).await {
            Ok(bytes) => return Ok(DownloadResult::Fetched { bytes }),
            Err(e) => {
                let class = match &e {
                    Error::UpstreamUnavailable(_) | Error::AssetIntegrityMismatch { .. } => {
                        ErrorClass::Retryable
                    }
                    _ => ErrorClass::Permanent,
                };
                if class == ErrorClass::Permanent || attempt >= retry.max_attempts {
                    return Err(e);
                }
                let delay = calculate_delay(retry, attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn download_once(
    store: &FileStore,
    client: &UpstreamClient,
    item: &WorkItem,
    expect: &Expectation,
) -> Result<u64> {
    let response = client.begin_download(&item.source_url).await?;
    let mut pending = store.open_write(&item.dest_relpath).await?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::UpstreamUnavailable(format!("{}: {e}", item.source_url)))?;
        pending.write_chunk(&chunk).await?;
    }

    let committed = pending.commit(Some(expect)).await?;
    Ok(committed.size)
}
