//! Core domain types for the offline editor release & extension gallery mirror.
//!
//! This crate defines the wire-compatible and on-disk shapes shared by every
//! other `gallery-mirror-*` crate:
//!
//! - [`BinaryRelease`] / [`Quality`] — platform builds of the editor.
//! - [`ExtensionMetadata`] / [`ExtensionVersion`] / [`Asset`] / [`ExtensionRecord`] —
//!   the marketplace extension aggregate.
//! - [`RecommendationSet`] / [`MaliciousList`] — operator- and upstream-driven
//!   identity sets that steer what the synchronizer fetches or purges.
//! - [`WorkItem`] — a resolved unit of download work.
//! - [`Error`] — the shared error taxonomy, mapped to HTTP status codes by
//!   `gallery-mirror-api` and to process exit codes by `gallery-mirror-cli`.
//!
//! Every type that models an upstream-provided JSON object carries an `extra`
//! side channel (`BTreeMap<String, serde_json::Value>`, `#[serde(flatten)]`)
//! so unknown fields survive a decode -> store -> re-encode round trip.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named release track of the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Stable,
    Insider,
    Exploration,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Stable => "stable",
            Quality::Insider => "insider",
            Quality::Exploration => "exploration",
        }
    }

    pub fn all() -> [Quality; 3] {
        [Quality::Stable, Quality::Insider, Quality::Exploration]
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(Quality::Stable),
            "insider" => Ok(Quality::Insider),
            "exploration" => Ok(Quality::Exploration),
            other => Err(Error::ConfigInvalid(format!("unknown quality channel: {other}"))),
        }
    }
}

/// A platform build of the editor (e.g. `win32-x64-archive`, `linux-x64`, `darwin`).
///
/// Identity: `(platform, quality, commit)`. Never mutated once materialized;
/// removed only by retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryRelease {
    pub platform: String,
    pub quality: Quality,
    pub commit: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub hash: Option<String>,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BinaryRelease {
    /// `(platform, quality, commit)`, the identity tuple for a binary release.
    pub fn identity(&self) -> (String, Quality, String) {
        (self.platform.clone(), self.quality, self.commit.clone())
    }

    pub fn relpath(&self, filename: &str) -> String {
        format!(
            "binaries/{}/{}/{}/{}",
            self.quality, self.platform, self.commit, filename
        )
    }

    pub fn latest_relpath(quality: Quality, platform: &str) -> String {
        format!("binaries/{quality}/{platform}/latest.json")
    }
}

/// Publisher metadata block, preserved mostly verbatim from upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub publisher_id: String,
    pub publisher_name: String,
    pub display_name: String,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Gallery flags on an extension (e.g. `preview`, `verified`, `public`).
///
/// Upstream encodes these as a space-delimited string; unknown tokens are
/// preserved in `other` so a round-tripped record never drops a flag this
/// mirror doesn't know the name of yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ExtensionFlags {
    pub preview: bool,
    pub verified: bool,
    pub public: bool,
    pub other: Vec<String>,
}

impl ExtensionFlags {
    pub fn parse(raw: &str) -> Self {
        let mut flags = ExtensionFlags::default();
        for token in raw.split_whitespace() {
            match token {
                "preview" => flags.preview = true,
                "verified" => flags.verified = true,
                "public" => flags.public = true,
                "" => {}
                other => flags.other.push(other.to_string()),
            }
        }
        flags
    }

    pub fn contains(&self, name: &str) -> bool {
        match name {
            "preview" => self.preview,
            "verified" => self.verified,
            "public" => self.public,
            other => self.other.iter().any(|f| f == other),
        }
    }

    /// True if any of `names` is set on this extension — used by the
    /// `ExcludeWithFlags` query filter.
    pub fn intersects(&self, names: &[String]) -> bool {
        names.iter().any(|n| self.contains(n))
    }
}

impl From<String> for ExtensionFlags {
    fn from(s: String) -> Self {
        ExtensionFlags::parse(&s)
    }
}

impl From<ExtensionFlags> for String {
    fn from(flags: ExtensionFlags) -> Self {
        let mut parts = Vec::new();
        if flags.public {
            parts.push("public".to_string());
        }
        if flags.verified {
            parts.push("verified".to_string());
        }
        if flags.preview {
            parts.push("preview".to_string());
        }
        parts.extend(flags.other);
        parts.join(" ")
    }
}

/// Install/rating counters for an extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionStatistics {
    #[serde(default)]
    pub install_count: u64,
    #[serde(default)]
    pub average_rating: f32,
    #[serde(default)]
    pub rating_count: u64,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Case-insensitive `publisher.name` identity, preserving upstream casing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionIdentifier(String);

impl ExtensionIdentifier {
    pub fn new(canonical: impl Into<String>) -> Self {
        Self(canonical.into())
    }

    /// The lowercase form used for identity comparison, map keys, and
    /// on-disk directory names.
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn publisher(&self) -> &str {
        self.0.split_once('.').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, n)| n).unwrap_or("")
    }
}

impl fmt::Display for ExtensionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for ExtensionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for ExtensionIdentifier {}

impl std::hash::Hash for ExtensionIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

/// Extension metadata (everything except the version list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Upstream-assigned opaque extension id (guid-like), distinct from `identifier`.
    #[serde(default)]
    pub extension_id: String,
    pub identifier: ExtensionIdentifier,
    pub display_name: String,
    #[serde(default)]
    pub short_description: String,
    pub publisher: Publisher,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: ExtensionFlags,
    #[serde(default)]
    pub statistics: ExtensionStatistics,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A single file belonging to an extension version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_type: String,
    /// Path relative to the version's directory.
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Well-known asset type strings: package, manifest, icon, readme,
/// changelog, license, translations.
pub mod asset_type {
    pub const PACKAGE: &str = "Microsoft.VisualStudio.Services.VSIXPackage";
    pub const MANIFEST: &str = "Microsoft.VisualStudio.Code.Manifest";
    pub const ICON: &str = "Microsoft.VisualStudio.Services.Icons.Default";
    pub const README: &str = "Microsoft.VisualStudio.Services.Content.Details";
    pub const CHANGELOG: &str = "Microsoft.VisualStudio.Services.Content.Changelog";
    pub const LICENSE: &str = "Microsoft.VisualStudio.Services.Content.License";
    pub const TRANSLATIONS: &str = "Microsoft.VisualStudio.Code.Translations";
}

/// A version of an extension. Identity within the extension: `(version, target_platform)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionVersion {
    pub version: String,
    #[serde(default)]
    pub target_platform: Option<String>,
    #[serde(default)]
    pub pre_release: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub engine: Option<String>,
    pub assets: Vec<Asset>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ExtensionVersion {
    pub fn identity(&self) -> (String, Option<String>) {
        (self.version.clone(), self.target_platform.clone())
    }

    pub fn asset(&self, asset_type: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.asset_type == asset_type)
    }

    /// Relative directory for this version under the extension's own directory.
    pub fn dir_relpath(&self) -> String {
        match &self.target_platform {
            Some(target) => format!("{}/{}", self.version, target),
            None => self.version.clone(),
        }
    }

    fn semver_key(&self) -> semver::Version {
        semver::Version::parse(self.version.trim_start_matches('v'))
            .unwrap_or(semver::Version::new(0, 0, 0))
    }
}

/// The aggregate persisted per extension: metadata plus newest-first versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub identifier: ExtensionIdentifier,
    pub metadata: ExtensionMetadata,
    /// Totally ordered by (semver-desc, timestamp-desc); head is "latest".
    pub versions: Vec<ExtensionVersion>,
}

impl ExtensionRecord {
    /// Order newest-first: semver-desc, then upload-timestamp-desc to break
    /// ties (e.g. equal version, different target platform).
    pub fn sort_versions(&mut self) {
        self.versions.sort_by(|a, b| {
            b.semver_key()
                .cmp(&a.semver_key())
                .then_with(|| b.last_updated.cmp(&a.last_updated))
        });
    }

    /// The head version, excluding pre-release unless `include_pre_release`.
    pub fn latest(&self, include_pre_release: bool) -> Option<&ExtensionVersion> {
        self.versions
            .iter()
            .find(|v| include_pre_release || !v.pre_release)
    }

    pub fn version(&self, version: &str, target_platform: Option<&str>) -> Option<&ExtensionVersion> {
        self.versions.iter().find(|v| {
            v.version == version && v.target_platform.as_deref() == target_platform
        })
    }
}

/// Operator allow list, `specified.json`: `{ "extensions": [ "publisher.name", ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecifiedList {
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Operator deny list, `malicious.json`: `{ "malicious": [ "publisher.name", ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaliciousList {
    #[serde(default)]
    pub malicious: Vec<String>,
}

impl MaliciousList {
    pub fn contains(&self, identifier: &str) -> bool {
        let key = identifier.to_ascii_lowercase();
        self.malicious.iter().any(|m| m.to_ascii_lowercase() == key)
    }
}

/// Ordered identifiers driving C5's extension work set: recommended, operator
/// `specified`, and an optional top-N marketplace slice. Not served to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub recommended: Vec<String>,
    pub specified: Vec<String>,
    pub top_n: Vec<String>,
}

impl RecommendationSet {
    pub fn union(&self) -> std::collections::BTreeSet<String> {
        self.recommended
            .iter()
            .chain(self.specified.iter())
            .chain(self.top_n.iter())
            .map(|s| s.to_ascii_lowercase())
            .collect()
    }
}

/// Which mode the resolver should run extension cataloging in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionsMode {
    All,
    Recommended,
    Specified,
    None,
}

/// The kind of artifact a [`WorkItem`] downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Binary,
    ExtensionAsset,
}

/// A resolved unit of download work produced by the Catalog Resolver (C3)
/// and consumed by the Download Pool (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkKind,
    /// Stable grouping key: for extensions, `publisher.name@version[+target]`;
    /// for binaries, `quality/platform@commit`. All assets of one group
    /// must commit before the group's `latest.json` is published.
    pub group: String,
    pub declared_size: Option<u64>,
    pub declared_hash: Option<String>,
    pub source_url: String,
    pub dest_relpath: String,
}

/// The shared error taxonomy. Conversions from lower-level errors
/// attach context rather than discarding it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream response malformed: {0}")]
    UpstreamMalformed(String),

    #[error(
        "asset integrity mismatch at {path}: expected size={expected_size:?} hash={expected_hash:?}, got size={actual_size} hash={actual_hash:?}"
    )]
    AssetIntegrityMismatch {
        path: String,
        expected_size: Option<u64>,
        expected_hash: Option<String>,
        actual_size: u64,
        actual_hash: Option<String>,
    },

    #[error("store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("malformed request: {0}")]
    RequestMalformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error, if encountered mid-pass, isolates to its own work
    /// item rather than aborting the whole pass.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_)
                | Error::UpstreamMalformed(_)
                | Error::AssetIntegrityMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn extension_flags_round_trip() {
        let flags = ExtensionFlags::parse("public verified custom-flag");
        assert!(flags.public);
        assert!(flags.verified);
        assert!(!flags.preview);
        assert!(flags.contains("custom-flag"));
        let s: String = flags.clone().into();
        assert_eq!(ExtensionFlags::parse(&s), flags);
    }

    #[test]
    fn identifier_is_case_insensitive() {
        let a = ExtensionIdentifier::new("Ms-Python.Python");
        let b = ExtensionIdentifier::new("ms-python.python");
        assert_eq!(a, b);
        assert_eq!(a.key(), "ms-python.python");
        assert_eq!(a.as_str(), "Ms-Python.Python");
        assert_eq!(a.publisher(), "Ms-Python");
        assert_eq!(a.name(), "Python");
    }

    #[test]
    fn malicious_list_is_case_insensitive() {
        let list = MaliciousList {
            malicious: vec!["Evil.Ext".to_string()],
        };
        assert!(list.contains("evil.ext"));
        assert!(!list.contains("good.ext"));
    }

    #[test]
    fn extension_record_sorts_versions_newest_first() {
        let mk = |v: &str, ts: i64| ExtensionVersion {
            version: v.to_string(),
            target_platform: None,
            pre_release: false,
            last_updated: DateTime::from_timestamp(ts, 0).unwrap(),
            engine: None,
            assets: vec![],
            extra: Default::default(),
        };

        let mut record = ExtensionRecord {
            identifier: ExtensionIdentifier::new("pub.ext"),
            metadata: ExtensionMetadata {
                extension_id: String::new(),
                identifier: ExtensionIdentifier::new("pub.ext"),
                display_name: "Ext".to_string(),
                short_description: String::new(),
                publisher: Publisher {
                    publisher_id: String::new(),
                    publisher_name: "pub".to_string(),
                    display_name: "Pub".to_string(),
                    extra: Default::default(),
                },
                categories: vec![],
                tags: vec![],
                flags: ExtensionFlags::default(),
                statistics: ExtensionStatistics::default(),
                icon: None,
                extra: Default::default(),
            },
            versions: vec![mk("1.0.0", 100), mk("2.1.0", 50), mk("2.0.0", 200)],
        };

        record.sort_versions();
        let versions: Vec<_> = record.versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(versions, vec!["2.1.0", "2.0.0", "1.0.0"]);
        assert_eq!(record.latest(false).unwrap().version, "2.1.0");
    }

    #[test]
    fn pre_release_is_excluded_from_latest_by_default() {
        let stable = ExtensionVersion {
            version: "1.0.0".to_string(),
            target_platform: None,
            pre_release: false,
            last_updated: Utc::now(),
            engine: None,
            assets: vec![],
            extra: Default::default(),
        };
        let mut pre = stable.clone();
        pre.version = "1.1.0".to_string();
        pre.pre_release = true;

        let record = ExtensionRecord {
            identifier: ExtensionIdentifier::new("pub.ext"),
            metadata: ExtensionMetadata {
                extension_id: String::new(),
                identifier: ExtensionIdentifier::new("pub.ext"),
                display_name: "Ext".to_string(),
                short_description: String::new(),
                publisher: Publisher {
                    publisher_id: String::new(),
                    publisher_name: "pub".to_string(),
                    display_name: "Pub".to_string(),
                    extra: Default::default(),
                },
                categories: vec![],
                tags: vec![],
                flags: ExtensionFlags::default(),
                statistics: ExtensionStatistics::default(),
                icon: None,
                extra: Default::default(),
            },
            versions: vec![pre, stable],
        };

        assert_eq!(record.latest(false).unwrap().version, "1.0.0");
        assert_eq!(record.latest(true).unwrap().version, "1.1.0");
    }

    #[test]
    fn error_item_scoping_isolates_per_item_failures() {
        assert!(Error::UpstreamUnavailable("x".into()).is_item_scoped());
        assert!(Error::UpstreamMalformed("x".into()).is_item_scoped());
        assert!(
            Error::AssetIntegrityMismatch {
                path: "x".into(),
                expected_size: None,
                expected_hash: None,
                actual_size: 0,
                actual_hash: None,
            }
            .is_item_scoped()
        );
        assert!(!Error::ConfigInvalid("x".into()).is_item_scoped());
        assert!(!Error::Cancelled.is_item_scoped());
    }

    #[test]
    fn extension_flags_debug_shape_snapshot() {
        let flags = ExtensionFlags::parse("public verified extra-flag");
        insta::assert_snapshot!(
            format!("{flags:?}"),
            @r#"ExtensionFlags { preview: false, verified: true, public: true, other: ["extra-flag"] }"#
        );
    }

    proptest! {
        #[test]
        fn extension_flags_round_trip_any_tokens(
            preview in any::<bool>(),
            verified in any::<bool>(),
            public in any::<bool>(),
            extra in proptest::collection::vec("[a-z][a-z0-9]{0,6}-custom", 0..4),
        ) {
            let mut tokens = Vec::new();
            if public { tokens.push("public".to_string()); }
            if verified { tokens.push("verified".to_string()); }
            if preview { tokens.push("preview".to_string()); }
            tokens.extend(extra.clone());
            let raw = tokens.join(" ");

            let flags = ExtensionFlags::parse(&raw);
            prop_assert_eq!(flags.preview, preview);
            prop_assert_eq!(flags.verified, verified);
            prop_assert_eq!(flags.public, public);

            let round_tripped: String = flags.clone().into();
            let reparsed = ExtensionFlags::parse(&round_tripped);
            prop_assert_eq!(reparsed, flags);
        }

        #[test]
        fn identifier_key_is_always_lowercase_of_input(s in "[A-Za-z][A-Za-z0-9_-]{0,15}\\.[A-Za-z][A-Za-z0-9_-]{0,15}") {
            let id = ExtensionIdentifier::new(s.clone());
            prop_assert_eq!(id.key(), s.to_ascii_lowercase());
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
