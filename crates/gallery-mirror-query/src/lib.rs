//! The extension gallery query protocol: filter/flag wire types, the
//! in-memory [`StoreIndex`] built by each sync pass, and the scorer that
//! answers a decoded query against it.
//!
//! The wire shapes here are intentionally forward-compatible: both
//! [`FilterType`] and [`ResponseFlags`] preserve codes they don't recognize
//! instead of rejecting the request, since an older mirror talking to a
//! newer client (or vice versa) should degrade rather than fail closed.

use std::collections::BTreeMap;

use gallery_mirror_store::FileStore;
use gallery_mirror_types::{BinaryRelease, ExtensionRecord, MaliciousList, Quality, RecommendationSet, Result};
use serde::{Deserialize, Serialize};

/// The kind of criterion a query filter matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterType {
    Tag,
    ExtensionId,
    Category,
    ExtensionName,
    Target,
    Featured,
    SearchText,
    ExcludeWithFlags,
    /// A filter type code this mirror doesn't assign meaning to yet.
    Unknown(i32),
}

impl FilterType {
    fn code(self) -> i32 {
        match self {
            FilterType::Tag => 1,
            FilterType::ExtensionId => 4,
            FilterType::Category => 5,
            FilterType::ExtensionName => 7,
            FilterType::Target => 8,
            FilterType::Featured => 9,
            FilterType::SearchText => 10,
            FilterType::ExcludeWithFlags => 12,
            FilterType::Unknown(code) => code,
        }
    }

    fn from_code(code: i32) -> Self {
        match code {
            1 => FilterType::Tag,
            4 => FilterType::ExtensionId,
            5 => FilterType::Category,
            7 => FilterType::ExtensionName,
            8 => FilterType::Target,
            9 => FilterType::Featured,
            10 => FilterType::SearchText,
            12 => FilterType::ExcludeWithFlags,
            other => FilterType::Unknown(other),
        }
    }
}

impl Serialize for FilterType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for FilterType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        Ok(FilterType::from_code(code))
    }
}

/// One `(filterType, value)` pair within a query filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub filter_type: FilterType,
    pub value: String,
}

/// A single filter group: the criteria are AND-ed, pagination and sort
/// apply to the group's result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub sort_by: u32,
    #[serde(default)]
    pub sort_order: u32,
}

fn default_page_number() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

/// Which optional pieces of each matched extension the client wants back.
/// Preserves bits this mirror doesn't assign meaning to in `unknown_bits`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFlags {
    pub include_versions: bool,
    pub include_files: bool,
    pub include_category_and_tags: bool,
    pub include_version_properties: bool,
    pub include_installation_targets: bool,
    pub include_asset_uri: bool,
    pub include_statistics: bool,
    pub include_latest_version_only: bool,
    pub unpublished: bool,
    pub unknown_bits: u32,
}

mod flag_bits {
    pub const INCLUDE_VERSIONS: u32 = 0x1;
    pub const INCLUDE_FILES: u32 = 0x2;
    pub const INCLUDE_CATEGORY_AND_TAGS: u32 = 0x4;
    pub const INCLUDE_VERSION_PROPERTIES: u32 = 0x10;
    pub const INCLUDE_INSTALLATION_TARGETS: u32 = 0x40;
    pub const INCLUDE_ASSET_URI: u32 = 0x80;
    pub const INCLUDE_STATISTICS: u32 = 0x100;
    pub const INCLUDE_LATEST_VERSION_ONLY: u32 = 0x200;
    pub const UNPUBLISHED: u32 = 0x1000;
    pub const ALL_KNOWN: u32 = INCLUDE_VERSIONS
        | INCLUDE_FILES
        | INCLUDE_CATEGORY_AND_TAGS
        | INCLUDE_VERSION_PROPERTIES
        | INCLUDE_INSTALLATION_TARGETS
        | INCLUDE_ASSET_URI
        | INCLUDE_STATISTICS
        | INCLUDE_LATEST_VERSION_ONLY
        | UNPUBLISHED;
}

impl ResponseFlags {
    pub fn from_bits(bits: u32) -> Self {
        use flag_bits::*;
        ResponseFlags {
            include_versions: bits & INCLUDE_VERSIONS != 0,
            include_files: bits & INCLUDE_FILES != 0,
            include_category_and_tags: bits & INCLUDE_CATEGORY_AND_TAGS != 0,
            include_version_properties: bits & INCLUDE_VERSION_PROPERTIES != 0,
            include_installation_targets: bits & INCLUDE_INSTALLATION_TARGETS != 0,
            include_asset_uri: bits & INCLUDE_ASSET_URI != 0,
            include_statistics: bits & INCLUDE_STATISTICS != 0,
            include_latest_version_only: bits & INCLUDE_LATEST_VERSION_ONLY != 0,
            unpublished: bits & UNPUBLISHED != 0,
            unknown_bits: bits & !ALL_KNOWN,
        }
    }

    pub fn to_bits(self) -> u32 {
        use flag_bits::*;
        let mut bits = self.unknown_bits;
        if self.include_versions {
            bits |= INCLUDE_VERSIONS;
        }
        if self.include_files {
            bits |= INCLUDE_FILES;
        }
        if self.include_category_and_tags {
            bits |= INCLUDE_CATEGORY_AND_TAGS;
        }
        if self.include_version_properties {
            bits |= INCLUDE_VERSION_PROPERTIES;
        }
        if self.include_installation_targets {
            bits |= INCLUDE_INSTALLATION_TARGETS;
        }
        if self.include_asset_uri {
            bits |= INCLUDE_ASSET_URI;
        }
        if self.include_statistics {
            bits |= INCLUDE_STATISTICS;
        }
        if self.include_latest_version_only {
            bits |= INCLUDE_LATEST_VERSION_ONLY;
        }
        if self.unpublished {
            bits |= UNPUBLISHED;
        }
        bits
    }
}

impl Serialize for ResponseFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.to_bits())
    }
}

impl<'de> Deserialize<'de> for ResponseFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(ResponseFlags::from_bits(bits))
    }
}

/// The decoded request body for an extension query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionQueryRequest {
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub asset_types: Vec<String>,
    #[serde(default)]
    pub flags: ResponseFlags,
}

/// A single extension as it appears in a query result, shaped by the
/// request's [`ResponseFlags`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionQueryResultItem {
    pub extension_id: String,
    pub extension_name: String,
    pub display_name: String,
    pub short_description: String,
    pub publisher: gallery_mirror_types::Publisher,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub statistics: Option<gallery_mirror_types::ExtensionStatistics>,
    #[serde(default)]
    pub versions: Vec<gallery_mirror_types::ExtensionVersion>,
}

/// One filter group's worth of matched extensions plus its page metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionQueryResultPage {
    pub extensions: Vec<ExtensionQueryResultItem>,
    pub result_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionQueryResult {
    pub results: Vec<ExtensionQueryResultPage>,
}

/// Snapshot of everything a sync pass produced, queried by both the search
/// engine and the asset-serving handlers. Immutable once built; a new pass
/// produces a new `StoreIndex` that the API swaps in atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreIndex {
    /// Keyed by `ExtensionIdentifier::key()`.
    pub extensions: BTreeMap<String, ExtensionRecord>,
    pub binaries: Vec<gallery_mirror_types::BinaryRelease>,
    pub recommendations: RecommendationSet,
    pub malicious: MaliciousList,
}

impl StoreIndex {
    /// Build a fresh snapshot by streaming the on-disk layout: one
    /// `latest.json` per extension directory under `extensions/`, skipping
    /// any directory whose `latest.json` is missing or unreadable at the
    /// instant of the scan. The index is an exact function of the on-disk
    /// contents at the moment it was built.
    pub async fn load(store: &FileStore) -> Result<Self> {
        let mut extensions = BTreeMap::new();
        for key in store.list_dir_names("extensions").await? {
            let relpath = format!("extensions/{key}/latest.json");
            match store.read_json::<ExtensionRecord>(&relpath).await {
                Ok(Some(record)) => {
                    extensions.insert(key, record);
                }
                Ok(None) => {
                    tracing::debug!(extension = %key, "skipping extension with no latest.json");
                }
                Err(e) => {
                    tracing::warn!(extension = %key, error = %e, "skipping unreadable extension record");
                }
            }
        }

        let mut binaries = Vec::new();
        for quality in Quality::all() {
            for platform in store.list_dir_names(&format!("binaries/{quality}")).await? {
                let relpath = BinaryRelease::latest_relpath(quality, &platform);
                match store.read_json::<BinaryRelease>(&relpath).await {
                    Ok(Some(release)) => binaries.push(release),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(quality = %quality, platform = %platform, error = %e, "skipping unreadable binary release");
                    }
                }
            }
        }

        let recommendations = store
            .read_json::<RecommendationSet>("extensions/recommended.json")
            .await?
            .unwrap_or_default();
        let malicious = store
            .read_json::<MaliciousList>("extensions/malicious.json")
            .await?
            .unwrap_or_default();

        Ok(StoreIndex {
            extensions,
            binaries,
            recommendations,
            malicious,
        })
    }

    pub fn get(&self, identifier: &str) -> Option<&ExtensionRecord> {
        self.extensions.get(&identifier.to_ascii_lowercase())
    }

    /// Look up the release for `(platform, quality)`, used by the update-check
    /// endpoint.
    pub fn latest_binary(&self, platform: &str, quality: Quality) -> Option<&BinaryRelease> {
        self.binaries
            .iter()
            .find(|b| b.platform == platform && b.quality == quality)
    }

    fn matches_category(record: &ExtensionRecord, value: &str) -> bool {
        record
            .metadata
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(value))
    }

    fn matches_tag(record: &ExtensionRecord, value: &str) -> bool {
        record.metadata.tags.iter().any(|t| t.eq_ignore_ascii_case(value))
    }

    /// Deterministic, field-weighted score for a free-text search term.
    /// Higher is better; `0` means no match.
    fn search_score(record: &ExtensionRecord, term: &str) -> u32 {
        let term = term.to_ascii_lowercase();
        if term.is_empty() {
            return 1;
        }
        let mut score = 0u32;
        if record.identifier.key() == term {
            score += 100;
        }
        if record.metadata.display_name.to_ascii_lowercase().contains(&term) {
            score += 40;
        }
        if record.identifier.name().to_ascii_lowercase().contains(&term) {
            score += 30;
        }
        if record
            .metadata
            .short_description
            .to_ascii_lowercase()
            .contains(&term)
        {
            score += 10;
        }
        if Self::matches_tag(record, &term) {
            score += 20;
        }
        if Self::matches_category(record, &term) {
            score += 15;
        }
        score
    }

    fn matches_criterion(&self, record: &ExtensionRecord, criterion: &Criterion) -> bool {
        match criterion.filter_type {
            FilterType::ExtensionId => record.metadata.extension_id == criterion.value,
            FilterType::ExtensionName => record.identifier.key() == criterion.value.to_ascii_lowercase(),
            FilterType::Category => Self::matches_category(record, &criterion.value),
            FilterType::Tag => Self::matches_tag(record, &criterion.value),
            FilterType::Target => true,
            FilterType::Featured => record.metadata.flags.contains("featured"),
            FilterType::SearchText => Self::search_score(record, &criterion.value) > 0,
            FilterType::ExcludeWithFlags => {
                let excluded: Vec<String> = criterion
                    .value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                !record.metadata.flags.intersects(&excluded)
            }
            FilterType::Unknown(_) => true,
        }
    }

    /// Run one filter group: match criteria, rank by search-text score when
    /// present, then paginate.
    fn run_filter(&self, filter: &QueryFilter, flags: ResponseFlags) -> ExtensionQueryResultPage {
        let search_term = filter
            .criteria
            .iter()
            .find(|c| c.filter_type == FilterType::SearchText)
            .map(|c| c.value.as_str());

        let mut matched: Vec<(&ExtensionRecord, u32)> = self
            .extensions
            .values()
            .filter(|record| !self.malicious.contains(record.identifier.as_str()))
            .filter(|record| filter.criteria.iter().all(|c| self.matches_criterion(record, c)))
            .map(|record| {
                let score = search_term.map(|t| Self::search_score(record, t)).unwrap_or(0);
                (record, score)
            })
            .collect();

        matched.sort_by(|(a, score_a), (b, score_b)| {
            score_b.cmp(score_a).then_with(|| {
                if search_term.is_some() {
                    a.identifier.key().cmp(&b.identifier.key())
                } else {
                    b.metadata
                        .statistics
                        .install_count
                        .cmp(&a.metadata.statistics.install_count)
                        .then_with(|| a.identifier.key().cmp(&b.identifier.key()))
                }
            })
        });

        let result_count = matched.len();
        let page_size = filter.page_size.max(1) as usize;
        let skip = (filter.page_number.max(1) as usize - 1) * page_size;

        let extensions = matched
            .into_iter()
            .skip(skip)
            .take(page_size)
            .map(|(record, _)| self.to_result_item(record, flags))
            .collect();

        ExtensionQueryResultPage {
            extensions,
            result_count,
        }
    }

    fn to_result_item(&self, record: &ExtensionRecord, flags: ResponseFlags) -> ExtensionQueryResultItem {
        let versions = if flags.include_versions {
            if flags.include_latest_version_only {
                record.latest(true).cloned().into_iter().collect()
            } else {
                record.versions.clone()
            }
        } else {
            Vec::new()
        };

        let versions = if flags.include_files {
            versions
        } else {
            versions
                .into_iter()
                .map(|mut v| {
                    v.assets.clear();
                    v
                })
                .collect()
        };

        ExtensionQueryResultItem {
            extension_id: record.metadata.extension_id.clone(),
            extension_name: record.identifier.name().to_string(),
            display_name: record.metadata.display_name.clone(),
            short_description: record.metadata.short_description.clone(),
            publisher: record.metadata.publisher.clone(),
            categories: if flags.include_category_and_tags {
                record.metadata.categories.clone()
            } else {
                Vec::new()
            },
            tags: if flags.include_category_and_tags {
                record.metadata.tags.clone()
            } else {
                Vec::new()
            },
            statistics: if flags.include_statistics {
                Some(record.metadata.statistics.clone())
            } else {
                None
            },
            versions,
        }
    }

    /// Answer a decoded query: every filter group runs independently
    /// against the full index.
    pub fn execute(&self, request: &ExtensionQueryRequest) -> ExtensionQueryResult {
        let results = request
            .filters
            .iter()
            .map(|filter| self.run_filter(filter, request.flags))
            .collect();
        ExtensionQueryResult { results }
    }
}
