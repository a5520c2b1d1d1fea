//! CLI entrypoint: `sync` runs one pass, `watch` repeats it on an interval,
//! `serve` runs the gallery API, `search` is a local diagnostic, `doctor`
//! prints the resolved configuration and checks that the artifact root is
//! writable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gallery_mirror_config::MirrorConfig;
use gallery_mirror_store::FileStore;
use gallery_mirror_sync::{SyncOptions, SyncSummary};
use gallery_mirror_types::{ExtensionsMode, MaliciousList, SpecifiedList};
use gallery_mirror_upstream::UpstreamClient;
use tokio_util::sync::CancellationToken;

/// Exit code for a pass that found nothing at all it could fetch or retain;
/// a pass with only isolated per-item failures still exits zero.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "gallery-mirror", version, about = "Offline mirror of an editor's release feed and extension gallery")]
struct Cli {
    /// Artifact root. Overrides the configured `store.root`.
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Path to a `gallery-mirror.toml` config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization pass and exit.
    Sync(SyncArgs),
    /// Run synchronization passes on a fixed interval until interrupted.
    Watch(SyncArgs),
    /// Query the on-disk index without touching upstream.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Serve the gallery API over HTTP.
    Serve,
    /// Print the resolved configuration and check the artifact root.
    Doctor,
}

#[derive(Parser, Clone)]
struct SyncArgs {
    #[arg(long, value_enum)]
    extensions_mode: Option<ExtensionsModeArg>,
    #[arg(long)]
    binaries: Option<bool>,
    #[arg(long)]
    include_pre_release: bool,
    #[arg(long)]
    total_recommended: Option<usize>,
    /// `watch` only: time between passes. Ignored by `sync`.
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExtensionsModeArg {
    All,
    Recommended,
    Specified,
    None,
}

impl From<ExtensionsModeArg> for ExtensionsMode {
    fn from(arg: ExtensionsModeArg) -> Self {
        match arg {
            ExtensionsModeArg::All => ExtensionsMode::All,
            ExtensionsModeArg::Recommended => ExtensionsMode::Recommended,
            ExtensionsModeArg::Specified => ExtensionsMode::Specified,
            ExtensionsModeArg::None => ExtensionsMode::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = MirrorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(root) = cli.store_root {
        config.store.root = root;
    }
    let store = Arc::new(FileStore::new(config.store.root.clone()));
    store.ensure_root().await.context("creating artifact root")?;

    match cli.command {
        Commands::Sync(args) => {
            let summary = run_sync_once(&config, store, &args).await?;
            tracing::info!(?summary, "sync pass finished");
            if summary.is_fatal() {
                std::process::exit(EXIT_FATAL);
            }
        }
        Commands::Watch(args) => run_watch(config, store, args).await?,
        Commands::Search { query, limit } => run_search(&store, &query, limit).await?,
        Commands::Serve => run_serve(&config, store).await?,
        Commands::Doctor => run_doctor(&config, &store).await?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn upstream_client(config: &gallery_mirror_config::UpstreamConfig) -> Result<UpstreamClient> {
    let upstream_config = gallery_mirror_upstream::UpstreamConfig {
        update_base_url: config.update_base_url.clone(),
        gallery_base_url: config.gallery_base_url.clone(),
        request_timeout: config.request_timeout,
        retry: config.retry.clone(),
    };
    UpstreamClient::new(upstream_config).context("building upstream client")
}

async fn load_specified(store: &FileStore) -> Result<SpecifiedList> {
    Ok(store
        .read_json("specified.json")
        .await
        .context("reading specified.json")?
        .unwrap_or_default())
}

async fn load_malicious(store: &FileStore) -> Result<MaliciousList> {
    Ok(store
        .read_json("extensions/malicious.json")
        .await
        .context("reading extensions/malicious.json")?
        .unwrap_or_default())
}

fn sync_options(config: &gallery_mirror_config::MirrorConfig, args: &SyncArgs) -> SyncOptions {
    SyncOptions {
        mode: args
            .extensions_mode
            .map(Into::into)
            .unwrap_or(config.extensions.mode),
        include_pre_release: args.include_pre_release || config.extensions.include_pre_release,
        total_recommended: args.total_recommended.or(config.extensions.total_recommended),
        fetch_binaries: args.binaries.unwrap_or(config.extensions.binaries),
        concurrency: config.sync.concurrency,
        ..Default::default()
    }
}

async fn run_sync_once(config: &MirrorConfig, store: Arc<FileStore>, args: &SyncArgs) -> Result<SyncSummary> {
    let upstream = Arc::new(upstream_client(&config.upstream)?);
    let specified = load_specified(&store).await?;
    let malicious = load_malicious(&store).await?;
    let options = sync_options(config, args);

    gallery_mirror_sync::run_pass(
        store,
        upstream,
        &config.store.root,
        &options,
        &specified,
        &malicious,
        CancellationToken::new(),
    )
    .await
    .context("sync pass failed")
}

async fn run_watch(config: MirrorConfig, store: Arc<FileStore>, args: SyncArgs) -> Result<()> {
    let interval = args.interval.unwrap_or(config.sync.interval);
    let upstream = Arc::new(upstream_client(&config.upstream)?);
    let options = sync_options(&config, &args);

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing current pass");
            ctrlc_cancel.cancel();
        }
    });

    loop {
        let specified = load_specified(&store).await?;
        let malicious = load_malicious(&store).await?;

        match gallery_mirror_sync::run_pass(
            store.clone(),
            upstream.clone(),
            &config.store.root,
            &options,
            &specified,
            &malicious,
            cancel.clone(),
        )
        .await
        {
            Ok(summary) => tracing::info!(?summary, "watch pass finished"),
            Err(e) => tracing::error!(error = %e, "watch pass failed"),
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

async fn run_search(store: &FileStore, query: &str, limit: usize) -> Result<()> {
    use gallery_mirror_query::{Criterion, ExtensionQueryRequest, FilterType, QueryFilter, ResponseFlags, StoreIndex};

    let index = StoreIndex::load(store).await.context("loading index")?;
    let request = ExtensionQueryRequest {
        filters: vec![QueryFilter {
            criteria: vec![Criterion {
                filter_type: FilterType::SearchText,
                value: query.to_string(),
            }],
            page_number: 1,
            page_size: limit as u32,
            sort_by: 0,
            sort_order: 0,
        }],
        asset_types: Vec::new(),
        flags: ResponseFlags {
            include_versions: true,
            ..Default::default()
        },
    };

    let result = index.execute(&request);
    let page = result.results.first().context("query produced no result page")?;
    println!("{} match(es) for \"{query}\"", page.result_count);
    for ext in &page.extensions {
        let version = ext
            .versions
            .first()
            .map(|v| v.version.as_str())
            .unwrap_or("-");
        println!(
            "{}.{}  {version}  {}",
            ext.publisher.publisher_name, ext.extension_name, ext.display_name
        );
    }
    Ok(())
}

async fn run_serve(config: &MirrorConfig, store: Arc<FileStore>) -> Result<()> {
    let index = gallery_mirror_query::StoreIndex::load(&store)
        .await
        .context("loading initial index")?;
    let base_url = config
        .api
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", config.api.bind_addr));

    let (router, handle) = gallery_mirror_api::build_router(store.clone(), index, base_url);

    let cancel = CancellationToken::new();
    let refresh_cancel = cancel.clone();
    let refresh_store = store.clone();
    let refresh_handle = handle.clone();
    let refresh_interval = config.sync.interval;
    let refresh_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => break,
                _ = tokio::time::sleep(refresh_interval) => {
                    if let Err(e) = refresh_handle.refresh(&refresh_store).await {
                        tracing::warn!(error = %e, "failed to refresh published index snapshot");
                    }
                }
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.api.bind_addr))?;
    tracing::info!(addr = %config.api.bind_addr, base_url = %base_url, "gallery API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await
        .context("gallery API server failed")?;

    refresh_task.await.ok();
    Ok(())
}

async fn run_doctor(config: &MirrorConfig, store: &FileStore) -> Result<()> {
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);

    let marker = "doctor/.writability-check";
    match store.write_all(marker, b"ok").await {
        Ok(_) => {
            store.remove(marker).await.ok();
            println!("artifact_root: {} (writable)", store.root().display());
        }
        Err(e) => println!("artifact_root: {} (NOT writable: {e})", store.root().display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_subcommand_with_flags() {
        let cli = Cli::parse_from([
            "gallery-mirror",
            "sync",
            "--extensions-mode",
            "all",
            "--binaries",
            "false",
            "--total-recommended",
            "25",
        ]);
        match cli.command {
            Commands::Sync(args) => {
                assert!(matches!(args.extensions_mode, Some(ExtensionsModeArg::All)));
                assert_eq!(args.binaries, Some(false));
                assert_eq!(args.total_recommended, Some(25));
            }
            _ => panic!("expected Sync"),
        }
    }

    #[test]
    fn parses_search_subcommand() {
        let cli = Cli::parse_from(["gallery-mirror", "search", "python", "--limit", "5"]);
        match cli.command {
            Commands::Search { query, limit } => {
                assert_eq!(query, "python");
                assert_eq!(limit, 5);
            }
            _ => panic!("expected Search"),
        }
    }

    #[test]
    fn sync_args_fall_back_to_config_when_unset() {
        let mut config = MirrorConfig::new();
        config.extensions.mode = ExtensionsMode::Specified;
        config.extensions.binaries = false;

        let args = SyncArgs {
            extensions_mode: None,
            binaries: None,
            include_pre_release: false,
            total_recommended: None,
            interval: None,
        };
        let options = sync_options(&config, &args);
        assert_eq!(options.mode, ExtensionsMode::Specified);
        assert!(!options.fetch_binaries);
    }

    #[test]
    fn cli_flags_override_config_values() {
        let config = MirrorConfig::new();
        let args = SyncArgs {
            extensions_mode: Some(ExtensionsModeArg::All),
            binaries: Some(true),
            include_pre_release: true,
            total_recommended: Some(10),
            interval: None,
        };
        let options = sync_options(&config, &args);
        assert_eq!(options.mode, ExtensionsMode::All);
        assert!(options.include_pre_release);
        assert_eq!(options.total_recommended, Some(10));
    }

    #[tokio::test]
    async fn doctor_reports_a_writable_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.ensure_root().await.unwrap();
        let config = MirrorConfig::new();
        run_doctor(&config, &store).await.unwrap();
        assert!(!dir.path().join("doctor").join(".writability-check").exists());
    }

    #[tokio::test]
    async fn missing_operator_inputs_default_to_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.ensure_root().await.unwrap();
        assert!(load_specified(&store).await.unwrap().extensions.is_empty());
        assert!(load_malicious(&store).await.unwrap().malicious.is_empty());
    }
}
