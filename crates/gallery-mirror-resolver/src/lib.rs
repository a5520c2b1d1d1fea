//! Pure planning for a sync pass.
//!
//! [`resolve`] takes everything already fetched from upstream plus the
//! operator's selection policy and computes, without touching the
//! filesystem or the network, exactly which assets need downloading and
//! what the resulting store should contain. The synchronizer (C5) does the
//! I/O; this crate only decides what I/O is needed.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use gallery_mirror_types::{
    Asset, BinaryRelease, Error, ExtensionFlags, ExtensionIdentifier, ExtensionMetadata,
    ExtensionRecord, ExtensionVersion, ExtensionsMode, MaliciousList, Publisher, RecommendationSet,
    Result, WorkItem, WorkKind,
};

/// One asset as reported by the upstream gallery, before it's been fetched.
#[derive(Debug, Clone)]
pub struct CandidateAsset {
    pub asset_type: String,
    pub source_url: String,
    pub declared_size: Option<u64>,
    pub declared_hash: Option<String>,
}

/// One version of an extension as reported by upstream.
#[derive(Debug, Clone)]
pub struct CandidateVersion {
    pub version: String,
    pub target_platform: Option<String>,
    pub pre_release: bool,
    pub last_updated: DateTime<Utc>,
    pub engine: Option<String>,
    pub assets: Vec<CandidateAsset>,
}

/// One extension as reported by upstream, with every version upstream sent back.
#[derive(Debug, Clone)]
pub struct CandidateExtension {
    pub identifier: ExtensionIdentifier,
    pub extension_id: String,
    pub display_name: String,
    pub short_description: String,
    pub publisher: Publisher,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub flags: ExtensionFlags,
    pub versions: Vec<CandidateVersion>,
}

#[derive(Debug, Clone)]
pub struct SkippedExtension {
    pub identifier: String,
    pub reason: String,
}

/// Everything [`resolve`] needs, gathered up front so the computation
/// itself touches neither disk nor network.
#[derive(Debug, Clone)]
pub struct ResolveInput<'a> {
    pub mode: ExtensionsMode,
    pub include_pre_release: bool,
    /// Cap on how many of the upstream's recommended/top-N identifiers to
    /// keep, applied after malicious-list exclusion. `None` means no cap.
    pub total_recommended: Option<usize>,
    /// How many of the newest versions satisfying the pre-release policy
    /// to fetch per extension in this pass (spec §4.3's "newest N
    /// versions per extension"). Always treated as at least 1.
    pub extensions_per_pass: usize,
    pub candidates: &'a [CandidateExtension],
    pub recommendations: &'a RecommendationSet,
    pub malicious: &'a MaliciousList,
    pub fetched_binaries: &'a [BinaryRelease],
}

/// The computed outcome of one resolve: what to download, and the
/// records that should end up in the store once downloads succeed.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    pub extension_work: Vec<WorkItem>,
    pub binary_work: Vec<WorkItem>,
    /// Draft records (assets not yet verified against disk) keyed by the
    /// same `group` used in `extension_work`'s `WorkItem::group`.
    pub draft_records: Vec<ExtensionRecord>,
    pub skipped: Vec<SkippedExtension>,
}

fn select_identifiers(input: &ResolveInput<'_>) -> Option<BTreeSet<String>> {
    match input.mode {
        ExtensionsMode::None => Some(BTreeSet::new()),
        ExtensionsMode::All => None,
        ExtensionsMode::Recommended => {
            let mut set = input.recommendations.union();
            if let Some(cap) = input.total_recommended {
                set = set.into_iter().take(cap).collect();
            }
            Some(set)
        }
        ExtensionsMode::Specified => Some(
            input
                .recommendations
                .specified
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        ),
    }
}

fn asset_file_name(asset_type: &str) -> String {
    match asset_type {
        gallery_mirror_types::asset_type::PACKAGE => "extension.vsix".to_string(),
        gallery_mirror_types::asset_type::MANIFEST => "package.json".to_string(),
        gallery_mirror_types::asset_type::ICON => "icon.png".to_string(),
        gallery_mirror_types::asset_type::README => "README.md".to_string(),
        gallery_mirror_types::asset_type::CHANGELOG => "CHANGELOG.md".to_string(),
        gallery_mirror_types::asset_type::LICENSE => "LICENSE".to_string(),
        gallery_mirror_types::asset_type::TRANSLATIONS => "translations.json".to_string(),
        other => {
            let slug: String = other
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
            format!("{slug}.bin")
        }
    }
}

fn binary_file_name(release: &BinaryRelease) -> String {
    format!("{}-{}.archive", release.platform, release.version)
}

/// Pick the newest `versions_per_extension` versions for a candidate
/// extension satisfying the pre-release policy, build their download work,
/// and stage a draft record carrying all of them (newest first).
fn plan_extension(
    candidate: &CandidateExtension,
    include_pre_release: bool,
    versions_per_extension: usize,
) -> std::result::Result<(ExtensionRecord, Vec<WorkItem>), String> {
    let mut versions: Vec<&CandidateVersion> = candidate.versions.iter().collect();
    versions.sort_by(|a, b| {
        let key_a = semver::Version::parse(a.version.trim_start_matches('v'))
            .unwrap_or(semver::Version::new(0, 0, 0));
        let key_b = semver::Version::parse(b.version.trim_start_matches('v'))
            .unwrap_or(semver::Version::new(0, 0, 0));
        key_b.cmp(&key_a).then_with(|| b.last_updated.cmp(&a.last_updated))
    });

    let chosen: Vec<&CandidateVersion> = versions
        .into_iter()
        .filter(|v| include_pre_release || !v.pre_release)
        .take(versions_per_extension.max(1))
        .collect();

    if chosen.is_empty() {
        return Err("no version satisfies the pre-release policy".to_string());
    }
    if chosen.iter().any(|v| v.assets.is_empty()) {
        return Err("chosen version has no assets".to_string());
    }

    let mut record_versions = Vec::with_capacity(chosen.len());
    let mut work = Vec::new();
    for candidate_version in chosen {
        let dir = match &candidate_version.target_platform {
            Some(target) => format!("{}/{}", candidate_version.version, target),
            None => candidate_version.version.clone(),
        };
        let group = format!("{}@{}", candidate.identifier.key(), candidate_version.version);

        let mut assets = Vec::with_capacity(candidate_version.assets.len());
        for candidate_asset in &candidate_version.assets {
            let file_name = asset_file_name(&candidate_asset.asset_type);
            assets.push(Asset {
                asset_type: candidate_asset.asset_type.clone(),
                path: file_name.clone(),
                size: candidate_asset.declared_size.unwrap_or(0),
                hash: candidate_asset.declared_hash.clone(),
            });
            work.push(WorkItem {
                kind: WorkKind::ExtensionAsset,
                group: group.clone(),
                declared_size: candidate_asset.declared_size,
                declared_hash: candidate_asset.declared_hash.clone(),
                source_url: candidate_asset.source_url.clone(),
                dest_relpath: format!(
                    "extensions/{}/{}/{}",
                    candidate.identifier.key(),
                    dir,
                    file_name
                ),
            });
        }

        record_versions.push(ExtensionVersion {
            version: candidate_version.version.clone(),
            target_platform: candidate_version.target_platform.clone(),
            pre_release: candidate_version.pre_release,
            last_updated: candidate_version.last_updated,
            engine: candidate_version.engine.clone(),
            assets,
            extra: Default::default(),
        });
    }

    let record = ExtensionRecord {
        identifier: candidate.identifier.clone(),
        metadata: ExtensionMetadata {
            extension_id: candidate.extension_id.clone(),
            identifier: candidate.identifier.clone(),
            display_name: candidate.display_name.clone(),
            short_description: candidate.short_description.clone(),
            publisher: candidate.publisher.clone(),
            categories: candidate.categories.clone(),
            tags: candidate.tags.clone(),
            flags: candidate.flags.clone(),
            statistics: Default::default(),
            icon: None,
            extra: Default::default(),
        },
        versions: record_versions,
    };

    Ok((record, work))
}

/// Compute the work and retention decision for one sync pass.
pub fn resolve(input: &ResolveInput<'_>) -> Result<ResolvedPlan> {
    if let ExtensionsMode::Specified = input.mode
        && input.recommendations.specified.is_empty()
    {
        return Err(Error::ConfigInvalid(
            "extensions mode is 'specified' but no extensions were specified".to_string(),
        ));
    }

    let wanted = select_identifiers(input);
    let mut plan = ResolvedPlan::default();

    for candidate in input.candidates {
        if input.malicious.contains(candidate.identifier.as_str()) {
            plan.skipped.push(SkippedExtension {
                identifier: candidate.identifier.as_str().to_string(),
                reason: "on the malicious list".to_string(),
            });
            continue;
        }

        if let Some(wanted) = &wanted
            && !wanted.contains(&candidate.identifier.key())
        {
            continue;
        }

        match plan_extension(candidate, input.include_pre_release, input.extensions_per_pass) {
            Ok((record, work)) => {
                plan.draft_records.push(record);
                plan.extension_work.extend(work);
            }
            Err(reason) => plan.skipped.push(SkippedExtension {
                identifier: candidate.identifier.as_str().to_string(),
                reason,
            }),
        }
    }

    for release in input.fetched_binaries {
        plan.binary_work.push(WorkItem {
            kind: WorkKind::Binary,
            group: format!("{}/{}@{}", release.quality, release.platform, release.commit),
            declared_size: Some(release.size),
            declared_hash: release.hash.clone(),
            source_url: release.url.clone(),
            dest_relpath: release.relpath(&binary_file_name(release)),
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gallery_mirror_types::Quality;
    use proptest::prelude::*;

    fn publisher() -> Publisher {
        Publisher {
            publisher_id: "id".to_string(),
            publisher_name: "pub".to_string(),
            display_name: "Pub".to_string(),
            extra: Default::default(),
        }
    }

    fn candidate(id: &str, versions: Vec<CandidateVersion>) -> CandidateExtension {
        CandidateExtension {
            identifier: ExtensionIdentifier::new(id),
            extension_id: format!("guid-{id}"),
            display_name: "Display".to_string(),
            short_description: "desc".to_string(),
            publisher: publisher(),
            categories: vec![],
            tags: vec![],
            flags: ExtensionFlags::default(),
            versions,
        }
    }

    fn version(v: &str, pre_release: bool) -> CandidateVersion {
        CandidateVersion {
            version: v.to_string(),
            target_platform: None,
            pre_release,
            last_updated: Utc::now(),
            engine: None,
            assets: vec![CandidateAsset {
                asset_type: gallery_mirror_types::asset_type::PACKAGE.to_string(),
                source_url: format!("https://example.com/{v}.vsix"),
                declared_size: Some(1024),
                declared_hash: Some("deadbeef".to_string()),
            }],
        }
    }

    #[test]
    fn all_mode_keeps_every_non_malicious_candidate() {
        let candidates = vec![
            candidate("pub.good", vec![version("1.0.0", false)]),
            candidate("pub.bad", vec![version("1.0.0", false)]),
        ];
        let recommendations = RecommendationSet::default();
        let mut malicious = MaliciousList::default();
        malicious.malicious.push("pub.bad".to_string());

        let input = ResolveInput {
            mode: ExtensionsMode::All,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 1,
            candidates: &candidates,
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &[],
        };

        let plan = resolve(&input).unwrap();
        assert_eq!(plan.draft_records.len(), 1);
        assert_eq!(plan.draft_records[0].identifier.as_str(), "pub.good");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].identifier, "pub.bad");
    }

    #[test]
    fn recommended_mode_respects_total_cap() {
        let candidates = vec![
            candidate("pub.a", vec![version("1.0.0", false)]),
            candidate("pub.b", vec![version("1.0.0", false)]),
            candidate("pub.c", vec![version("1.0.0", false)]),
        ];
        let recommendations = RecommendationSet {
            recommended: vec!["pub.a".to_string(), "pub.b".to_string(), "pub.c".to_string()],
            specified: vec![],
            top_n: vec![],
        };
        let malicious = MaliciousList::default();

        let input = ResolveInput {
            mode: ExtensionsMode::Recommended,
            include_pre_release: false,
            total_recommended: Some(2),
            extensions_per_pass: 1,
            candidates: &candidates,
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &[],
        };

        let plan = resolve(&input).unwrap();
        assert_eq!(plan.draft_records.len(), 2);
    }

    #[test]
    fn pre_release_only_extension_is_skipped_without_opt_in() {
        let candidates = vec![candidate("pub.ext", vec![version("1.0.0-beta", true)])];
        let recommendations = RecommendationSet::default();
        let malicious = MaliciousList::default();

        let input = ResolveInput {
            mode: ExtensionsMode::All,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 1,
            candidates: &candidates,
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &[],
        };

        let plan = resolve(&input).unwrap();
        assert!(plan.draft_records.is_empty());
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("pre-release"));
    }

    #[test]
    fn specified_mode_without_any_specified_extensions_is_a_config_error() {
        let candidates = vec![candidate("pub.ext", vec![version("1.0.0", false)])];
        let recommendations = RecommendationSet::default();
        let malicious = MaliciousList::default();

        let input = ResolveInput {
            mode: ExtensionsMode::Specified,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 1,
            candidates: &candidates,
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &[],
        };

        assert!(matches!(resolve(&input), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn extensions_per_pass_fetches_the_newest_n_versions() {
        let candidates = vec![candidate(
            "pub.ext",
            vec![
                version("1.0.0", false),
                version("1.2.0", false),
                version("1.1.0", false),
            ],
        )];
        let recommendations = RecommendationSet::default();
        let malicious = MaliciousList::default();

        let input = ResolveInput {
            mode: ExtensionsMode::All,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 2,
            candidates: &candidates,
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &[],
        };

        let plan = resolve(&input).unwrap();
        assert_eq!(plan.draft_records.len(), 1);
        let versions: Vec<&str> = plan.draft_records[0]
            .versions
            .iter()
            .map(|v| v.version.as_str())
            .collect();
        assert_eq!(versions, vec!["1.2.0", "1.1.0"]);
        // Two versions, one asset each.
        assert_eq!(plan.extension_work.len(), 2);
    }

    #[test]
    fn binary_releases_always_produce_work_regardless_of_extensions_mode() {
        let recommendations = RecommendationSet::default();
        let malicious = MaliciousList::default();
        let release = BinaryRelease {
            platform: "linux-x64".to_string(),
            quality: Quality::Stable,
            commit: "abc123".to_string(),
            version: "1.90.0".to_string(),
            url: "https://example.com/linux-x64.tar.gz".to_string(),
            hash: None,
            size: 2048,
            timestamp: Utc::now(),
            extra: Default::default(),
        };
        let binaries = vec![release];

        let input = ResolveInput {
            mode: ExtensionsMode::None,
            include_pre_release: false,
            total_recommended: None,
            extensions_per_pass: 1,
            candidates: &[],
            recommendations: &recommendations,
            malicious: &malicious,
            fetched_binaries: &binaries,
        };

        let plan = resolve(&input).unwrap();
        assert_eq!(plan.binary_work.len(), 1);
        assert_eq!(plan.draft_records.len(), 0);
    }

    proptest! {
        #[test]
        fn asset_file_name_is_always_a_bare_filename(asset_type in "\\PC{1,40}") {
            let name = asset_file_name(&asset_type);
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('/'));
            prop_assert!(!name.contains('\\'));
            prop_assert!(!name.contains('\0'));
        }

        #[test]
        fn plan_extension_never_picks_a_pre_release_when_excluded(
            stable_ts in 0i64..1_000_000,
            pre_ts in 0i64..1_000_000,
        ) {
            let mk = |v: &str, ts: i64, pre: bool| CandidateVersion {
                version: v.to_string(),
                target_platform: None,
                pre_release: pre,
                last_updated: DateTime::from_timestamp(ts, 0).unwrap(),
                engine: None,
                assets: vec![CandidateAsset {
                    asset_type: gallery_mirror_types::asset_type::PACKAGE.to_string(),
                    source_url: "https://example.com/ext.vsix".to_string(),
                    declared_size: Some(10),
                    declared_hash: None,
                }],
            };
            let candidate = candidate(
                "pub.ext",
                vec![mk("1.0.0", stable_ts, false), mk("1.1.0-pre", pre_ts.max(stable_ts) + 1, true)],
            );

            let (record, _work) = plan_extension(&candidate, false, 1).unwrap();
            prop_assert!(record.versions.iter().all(|v| !v.pre_release));
        }
    }
}
