//! Layered configuration: environment variables override a `.toml` file,
//! which overrides built-in defaults.
//!
//! The environment layer exists because this mirror is meant to run as a
//! long-lived service where operators set `GALLERY_MIRROR_*` env vars
//! rather than editing a file on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gallery_mirror_retry::RetryStrategyConfig;
use gallery_mirror_types::{Error, ExtensionsMode, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "gallery-mirror.toml";

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./gallery-mirror-data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub update_base_url: String,
    pub gallery_base_url: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub retry: RetryStrategyConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            update_base_url: "https://update.example.com/api".to_string(),
            gallery_base_url: "https://marketplace.example.com/api".to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    pub mode: ExtensionsMode,
    pub include_pre_release: bool,
    pub total_recommended: Option<usize>,
    pub binaries: bool,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            mode: ExtensionsMode::Recommended,
            include_pre_release: false,
            total_recommended: None,
            binaries: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Externally reachable base URL used to build absolute asset URIs and
    /// update-manifest download links. `bind_addr` is often `0.0.0.0:...`
    /// and not itself a usable client-facing address, so this is tracked
    /// separately.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            concurrency: 8,
        }
    }
}

/// Complete resolved configuration for the mirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl MirrorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, merge a TOML file if `path` exists, then apply any
    /// recognized `GALLERY_MIRROR_*` environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GALLERY_MIRROR_STORE_ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_UPDATE_BASE_URL") {
            self.upstream.update_base_url = v;
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_GALLERY_BASE_URL") {
            self.upstream.gallery_base_url = v;
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_EXTENSIONS_MODE") {
            if let Some(mode) = parse_extensions_mode(&v) {
                self.extensions.mode = mode;
            }
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_INCLUDE_PRE_RELEASE") {
            self.extensions.include_pre_release = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_TOTAL_RECOMMENDED") {
            self.extensions.total_recommended = v.parse().ok();
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_BINARIES") {
            self.extensions.binaries = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_API_BIND_ADDR") {
            self.api.bind_addr = v;
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_API_PUBLIC_URL") {
            self.api.public_url = Some(v);
        }
        if let Ok(v) = std::env::var("GALLERY_MIRROR_SYNC_INTERVAL") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.sync.interval = d;
            }
        }
    }
}

fn parse_extensions_mode(s: &str) -> Option<ExtensionsMode> {
    match s.to_ascii_lowercase().as_str() {
        "all" => Some(ExtensionsMode::All),
        "recommended" => Some(ExtensionsMode::Recommended),
        "specified" => Some(ExtensionsMode::Specified),
        "none" => Some(ExtensionsMode::None),
        _ => None,
    }
}

fn load_from_file(path: &Path) -> Result<MirrorConfig> {
    if !path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
}

pub fn save_config(path: &Path, config: &MirrorConfig) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::ConfigInvalid(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = MirrorConfig::new();
        assert_eq!(config.extensions.mode, ExtensionsMode::Recommended);
        assert!(config.extensions.binaries);
        assert_eq!(config.sync.interval, Duration::from_secs(900));
    }

    #[test]
    fn load_missing_file_returns_default() {
        let td = tempfile::tempdir().unwrap();
        let config = MirrorConfig::load(Some(&config_path(td.path()))).unwrap();
        assert_eq!(config.api.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn load_parses_toml_file() {
        let td = tempfile::tempdir().unwrap();
        let path = config_path(td.path());
        std::fs::write(
            &path,
            r#"
[store]
root = "/data/mirror"

[upstream]
update_base_url = "https://update.internal/api"
gallery_base_url = "https://gallery.internal/api"
request_timeout = "10s"

[extensions]
mode = "all"
include_pre_release = true
binaries = false

[api]
bind_addr = "127.0.0.1:9000"

[sync]
interval = "5m"
concurrency = 4
"#,
        )
        .unwrap();

        let config = MirrorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.root, PathBuf::from("/data/mirror"));
        assert_eq!(config.extensions.mode, ExtensionsMode::All);
        assert!(config.extensions.include_pre_release);
        assert!(!config.extensions.binaries);
        assert_eq!(config.api.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.sync.interval, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn env_vars_override_file_and_defaults() {
        let td = tempfile::tempdir().unwrap();
        let path = config_path(td.path());
        std::fs::write(&path, "[api]\nbind_addr = \"127.0.0.1:9000\"\n").unwrap();

        unsafe {
            std::env::set_var("GALLERY_MIRROR_API_BIND_ADDR", "0.0.0.0:7777");
        }
        let config = MirrorConfig::load(Some(&path)).unwrap();
        unsafe {
            std::env::remove_var("GALLERY_MIRROR_API_BIND_ADDR");
        }

        assert_eq!(config.api.bind_addr, "0.0.0.0:7777");
    }

    #[test]
    fn save_and_load_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let path = config_path(td.path());

        let mut config = MirrorConfig::new();
        config.extensions.total_recommended = Some(50);
        save_config(&path, &config).unwrap();

        let loaded = MirrorConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.extensions.total_recommended, Some(50));
    }
}
