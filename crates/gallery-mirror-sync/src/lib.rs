//! The synchronizer (C5): one full pass from "fetch upstream catalogs" to
//! "store index rewritten on disk," under a [`lock::LockFile`] so at most
//! one pass touches a given artifact root at a time.

pub mod lock;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gallery_mirror_download::{DownloadPool, ProgressCounters};
use gallery_mirror_events::{events_path, EventKind, EventLog, SyncEvent};
use gallery_mirror_query::{Criterion, FilterType, ExtensionQueryRequest, QueryFilter, StoreIndex};
use gallery_mirror_resolver::{resolve, CandidateAsset, CandidateExtension, CandidateVersion, ResolveInput};
use gallery_mirror_store::FileStore;
use gallery_mirror_types::{
    ExtensionFlags, ExtensionIdentifier, ExtensionsMode, MaliciousList, Quality, RecommendationSet,
    Result, SpecifiedList, WorkItem, WorkKind,
};
use gallery_mirror_upstream::{RawExtensionQueryResult, UpstreamClient};
use lock::LockFile;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// What one pass should do.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: ExtensionsMode,
    pub include_pre_release: bool,
    pub total_recommended: Option<usize>,
    /// How many of the newest versions per extension the resolver should
    /// fetch in this pass (spec §4.3's "newest N versions per extension").
    pub extensions_per_pass: usize,
    pub fetch_binaries: bool,
    pub binary_qualities: Vec<Quality>,
    pub binary_platforms: Vec<String>,
    pub concurrency: usize,
    pub lock_stale_after: Duration,
    /// Keep the newest `M` version directories per extension, bounding how
    /// many older versions (from this pass or prior ones, beyond
    /// `extensions_per_pass`) survive retention.
    pub retain_versions: usize,
    /// Keep the newest `K` commit directories per (quality, platform).
    pub retain_builds: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: ExtensionsMode::Recommended,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 1,
            fetch_binaries: true,
            binary_qualities: vec![Quality::Stable],
            binary_platforms: vec!["linux-x64".to_string(), "darwin-arm64".to_string()],
            concurrency: 8,
            lock_stale_after: Duration::from_secs(3600),
            retain_versions: 1,
            retain_builds: 3,
        }
    }
}

/// Outcome of one pass, logged and returned to the CLI for exit-code
/// determination.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub extensions_completed: u64,
    pub extensions_failed: u64,
    pub extensions_skipped: u64,
    pub binaries_completed: u64,
    pub binaries_failed: u64,
    pub duration_ms: u64,
}

impl SyncSummary {
    /// A pass is fatal only when nothing at all could be fetched or
    /// retained — isolated per-item failures (§7) don't count.
    pub fn is_fatal(&self) -> bool {
        self.extensions_completed == 0
            && self.binaries_completed == 0
            && (self.extensions_failed > 0 || self.binaries_failed > 0)
    }
}

/// Run one full sync pass: acquire the lock, fetch upstream catalogs,
/// resolve a plan, download what's missing, rewrite the index, release the
/// lock. Returns the summary even on a pass with per-item failures; only
/// propagates `Err` for conditions that prevented the pass from running at
/// all (e.g. the lock is already held).
#[instrument(skip(store, upstream, options, specified, malicious, cancel))]
pub async fn run_pass(
    store: Arc<FileStore>,
    upstream: Arc<UpstreamClient>,
    state_dir: &Path,
    options: &SyncOptions,
    specified: &SpecifiedList,
    malicious: &MaliciousList,
    cancel: CancellationToken,
) -> Result<SyncSummary> {
    let started = Instant::now();
    let mut lock = LockFile::acquire(state_dir, options.lock_stale_after)?;
    let mut events = EventLog::new();
    events.record(SyncEvent::new(
        "pass",
        EventKind::PassStarted {
            mode: format!("{:?}", options.mode),
        },
    ));

    let outcome = run_pass_locked(&store, &upstream, options, specified, malicious, &mut events, &cancel).await;

    let events_file = events_path(&store_state_dir(&store));
    if let Err(e) = events.write_to_file(&events_file) {
        warn!(error = %e, "failed to append to event log");
    }

    lock.release()?;

    match outcome {
        Ok(mut summary) => {
            summary.duration_ms = started.elapsed().as_millis() as u64;
            events.record(SyncEvent::new(
                "pass",
                EventKind::PassFinished {
                    extensions_completed: summary.extensions_completed,
                    extensions_failed: summary.extensions_failed,
                    binaries_completed: summary.binaries_completed,
                    binaries_failed: summary.binaries_failed,
                    duration_ms: summary.duration_ms,
                },
            ));
            info!(?summary, "sync pass finished");
            Ok(summary)
        }
        Err(e) => {
            warn!(error = %e, "sync pass failed");
            Err(e)
        }
    }
}

fn store_state_dir(store: &FileStore) -> std::path::PathBuf {
    store.root().to_path_buf()
}

async fn run_pass_locked(
    store: &Arc<FileStore>,
    upstream: &Arc<UpstreamClient>,
    options: &SyncOptions,
    specified: &SpecifiedList,
    malicious: &MaliciousList,
    events: &mut EventLog,
    cancel: &CancellationToken,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    let recommended = if matches!(options.mode, ExtensionsMode::Recommended) {
        upstream.fetch_recommended_identifiers().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to fetch recommendations, treating as empty");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let recommendations = RecommendationSet {
        recommended,
        specified: specified.extensions.clone(),
        top_n: Vec::new(),
    };

    let candidates = if matches!(options.mode, ExtensionsMode::None) {
        Vec::new()
    } else {
        fetch_candidates(upstream, options, &recommendations).await?
    };

    let mut fetched_binaries = Vec::new();
    if options.fetch_binaries {
        for quality in &options.binary_qualities {
            for platform in &options.binary_platforms {
                match upstream.fetch_binary_release(*quality, platform).await {
                    Ok(release) => fetched_binaries.push(release),
                    Err(e) => {
                        warn!(?quality, platform, error = %e, "failed to fetch binary release");
                        summary.binaries_failed += 1;
                        events.record(SyncEvent::new(
                            "binary",
                            EventKind::ItemDownloadFailed {
                                dest_relpath: format!("binaries/{quality}/{platform}"),
                                message: e.to_string(),
                            },
                        ));
                    }
                }
            }
        }
    }

    let input = ResolveInput {
        mode: options.mode,
        include_pre_release: options.include_pre_release,
        total_recommended: options.total_recommended,
        extensions_per_pass: options.extensions_per_pass,
        candidates: &candidates,
        recommendations: &recommendations,
        malicious,
        fetched_binaries: &fetched_binaries,
    };
    let plan = resolve(&input)?;
    summary.extensions_skipped = plan.skipped.len() as u64;
    for skipped in &plan.skipped {
        events.record(SyncEvent::new(
            &skipped.identifier,
            EventKind::ExtensionSkipped {
                reason: skipped.reason.clone(),
            },
        ));
    }

    let mut work = plan.extension_work.clone();
    work.extend(plan.binary_work.clone());

    let pool = DownloadPool::new(store.clone(), upstream.clone(), options.concurrency, upstream_retry(upstream));
    let progress = Arc::new(ProgressCounters::default());
    let outcomes = pool.run(work, progress, cancel.clone()).await;

    for outcome in &outcomes {
        match (&outcome.error, outcome.item.kind) {
            (None, WorkKind::ExtensionAsset) => summary.extensions_completed += 1,
            (None, WorkKind::Binary) => summary.binaries_completed += 1,
            (Some(e), WorkKind::ExtensionAsset) => {
                summary.extensions_failed += 1;
                events.record(SyncEvent::new(
                    &outcome.item.group,
                    EventKind::ItemDownloadFailed {
                        dest_relpath: outcome.item.dest_relpath.clone(),
                        message: e.to_string(),
                    },
                ));
            }
            (Some(e), WorkKind::Binary) => {
                summary.binaries_failed += 1;
                events.record(SyncEvent::new(
                    &outcome.item.group,
                    EventKind::ItemDownloadFailed {
                        dest_relpath: outcome.item.dest_relpath.clone(),
                        message: e.to_string(),
                    },
                ));
            }
        }
    }

    // `WorkItem::group` for an extension is `"<identifier key>@<version>"`;
    // strip the version to get the identifier key a failed item belongs to.
    let failed_identifier_keys: std::collections::BTreeSet<&str> = outcomes
        .iter()
        .filter(|o| o.error.is_some() && o.item.kind == WorkKind::ExtensionAsset)
        .map(|o| o.item.group.split('@').next().unwrap_or(o.item.group.as_str()))
        .collect();

    let mut surviving_records = Vec::new();
    for mut record in plan.draft_records {
        if failed_identifier_keys.contains(record.identifier.key().as_str()) {
            continue;
        }
        record.sort_versions();
        surviving_records.push(record);
    }

    for record in &surviving_records {
        publish_extension_record(store, record, options.retain_versions, events).await?;
    }

    purge_malicious(store, malicious, events).await?;

    for release in &fetched_binaries {
        publish_binary_release(store, release, options.retain_builds, events).await?;
    }

    // Aggregate index: a streaming rebuild from disk, so `extensions.json`
    // only ever lists extensions whose `latest.json` actually exists (§8
    // invariant 3), regardless of which identifiers this particular pass
    // touched.
    let rebuilt = StoreIndex::load(store).await?;
    store
        .write_json("extensions/extensions.json", &rebuilt.extensions.values().collect::<Vec<_>>())
        .await?;
    store.write_json("extensions/recommended.json", &recommendations).await?;
    store.write_json("extensions/malicious.json", malicious).await?;

    Ok(summary)
}

/// Write one extension's newest version(s) to disk and point `latest.json`
/// at them, only after every referenced asset is already committed.
/// Applies per-extension version retention.
async fn publish_extension_record(
    store: &FileStore,
    record: &gallery_mirror_types::ExtensionRecord,
    retain_versions: usize,
    events: &mut EventLog,
) -> Result<()> {
    let key = record.identifier.key();
    let ext_dir = format!("extensions/{key}");

    let mut kept: std::collections::BTreeSet<String> =
        record.versions.iter().map(|v| v.dir_relpath()).collect();

    let mut existing_dirs = store.list_dir_names(&ext_dir).await?;
    existing_dirs.sort();
    if kept.len() < retain_versions.max(1) {
        for dir in existing_dirs.iter().rev() {
            if kept.len() >= retain_versions.max(1) {
                break;
            }
            kept.insert(dir.clone());
        }
    }

    for dir in &existing_dirs {
        if !kept.contains(dir) {
            store.remove_dir(&format!("{ext_dir}/{dir}")).await?;
            events.record(SyncEvent::new(
                &key,
                EventKind::RetentionPurged {
                    dest_relpath: format!("{ext_dir}/{dir}"),
                },
            ));
        }
    }

    store.write_json(&format!("{ext_dir}/latest.json"), record).await?;
    Ok(())
}

/// Remove every malicious-listed extension's directory so neither the
/// on-disk tree nor a subsequently rebuilt index ever surfaces it.
async fn purge_malicious(store: &FileStore, malicious: &MaliciousList, events: &mut EventLog) -> Result<()> {
    for key in store.list_dir_names("extensions").await? {
        if malicious.contains(&key) {
            store.remove_dir(&format!("extensions/{key}")).await?;
            events.record(SyncEvent::new(
                &key,
                EventKind::RetentionPurged {
                    dest_relpath: format!("extensions/{key}"),
                },
            ));
        }
    }
    Ok(())
}

/// Write a binary release's `latest.json` and retain only the newest `K`
/// commit directories for its (quality, platform).
async fn publish_binary_release(
    store: &FileStore,
    release: &gallery_mirror_types::BinaryRelease,
    retain_builds: usize,
    events: &mut EventLog,
) -> Result<()> {
    let base = format!("binaries/{}/{}", release.quality, release.platform);
    let mut commits = store.list_dir_names(&base).await?;
    commits.sort();

    let retain = retain_builds.max(1);
    if commits.len() > retain {
        for stale in &commits[..commits.len() - retain] {
            if stale == &release.commit {
                continue;
            }
            store.remove_dir(&format!("{base}/{stale}")).await?;
            events.record(SyncEvent::new(
                "binary",
                EventKind::RetentionPurged {
                    dest_relpath: format!("{base}/{stale}"),
                },
            ));
        }
    }

    store
        .write_json(&gallery_mirror_types::BinaryRelease::latest_relpath(release.quality, &release.platform), release)
        .await?;
    Ok(())
}

fn upstream_retry(upstream: &UpstreamClient) -> gallery_mirror_retry::RetryStrategyConfig {
    upstream.config().retry.clone()
}

/// Build and issue whatever extension query the selected mode needs, then
/// convert the upstream's raw response into resolver input.
async fn fetch_candidates(
    upstream: &UpstreamClient,
    options: &SyncOptions,
    recommendations: &RecommendationSet,
) -> Result<Vec<CandidateExtension>> {
    let request = match options.mode {
        ExtensionsMode::All | ExtensionsMode::None => ExtensionQueryRequest::default(),
        ExtensionsMode::Recommended | ExtensionsMode::Specified => {
            let wanted = recommendations.union();
            ExtensionQueryRequest {
                filters: vec![QueryFilter {
                    criteria: wanted
                        .into_iter()
                        .map(|identifier| Criterion {
                            filter_type: FilterType::ExtensionName,
                            value: identifier,
                        })
                        .collect(),
                    page_number: 1,
                    page_size: 1000,
                    sort_by: 0,
                    sort_order: 0,
                }],
                ..Default::default()
            }
        }
    };

    let raw = upstream.fetch_extension_query(&request).await?;
    Ok(raw_into_candidates(raw))
}

fn raw_into_candidates(raw: RawExtensionQueryResult) -> Vec<CandidateExtension> {
    raw.results
        .into_iter()
        .flat_map(|page| page.extensions)
        .map(|ext| CandidateExtension {
            identifier: ExtensionIdentifier::new(format!(
                "{}.{}",
                ext.publisher.publisher_name, ext.extension_name
            )),
            extension_id: ext.extension_id,
            display_name: ext.display_name,
            short_description: ext.short_description,
            publisher: ext.publisher,
            categories: ext.categories,
            tags: ext.tags,
            flags: ExtensionFlags::from(ext.flags),
            versions: ext
                .versions
                .into_iter()
                .map(|v| CandidateVersion {
                    version: v.version,
                    target_platform: v.target_platform,
                    pre_release: v.pre_release,
                    last_updated: v.last_updated,
                    engine: v.engine,
                    assets: v
                        .files
                        .into_iter()
                        .map(|f| CandidateAsset {
                            asset_type: f.asset_type,
                            source_url: f.source,
                            declared_size: f.declared_size,
                            declared_hash: f.declared_hash,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect()
}
