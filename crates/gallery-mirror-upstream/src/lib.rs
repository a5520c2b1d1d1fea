//! Async HTTP client for the two upstream services this mirror shadows:
//! the editor's binary release feed and the extension gallery's query API.
//!
//! Every call is wrapped in [`gallery_mirror_retry::RetryExecutor`] using
//! the same backoff math the rest of the mirror uses, with failures
//! classified by HTTP status (`5xx`/`429`/transport errors retry; other
//! `4xx` don't).

use gallery_mirror_query::ExtensionQueryRequest;
use gallery_mirror_retry::{ErrorClass, RetryExecutor, RetryStrategyConfig};
use gallery_mirror_types::{BinaryRelease, Error, Publisher, Quality, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// One downloadable asset of an upstream extension version, in the shape
/// the real gallery actually returns it: a CDN `source` URL rather than a
/// local path, since this one hasn't been mirrored yet.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAssetFile {
    pub asset_type: String,
    pub source: String,
    #[serde(default)]
    pub declared_size: Option<u64>,
    #[serde(default)]
    pub declared_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawExtensionVersion {
    pub version: String,
    #[serde(default)]
    pub target_platform: Option<String>,
    #[serde(default)]
    pub pre_release: bool,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub files: Vec<RawAssetFile>,
    /// Unknown per-version fields the upstream sent, kept so a decode then
    /// re-encode (e.g. for diagnostics) doesn't silently drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawExtension {
    pub extension_id: String,
    pub extension_name: String,
    pub display_name: String,
    #[serde(default)]
    pub short_description: String,
    pub publisher: Publisher,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub versions: Vec<RawExtensionVersion>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtensionQueryResultPage {
    #[serde(default)]
    pub extensions: Vec<RawExtension>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtensionQueryResult {
    #[serde(default)]
    pub results: Vec<RawExtensionQueryResultPage>,
}

/// Where to reach the upstream services, and how hard to retry them.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the editor's release/update feed, e.g.
    /// `https://update.example.com/api`.
    pub update_base_url: String,
    /// Base URL of the extension gallery, e.g. `https://marketplace.example.com/api`.
    pub gallery_base_url: String,
    pub request_timeout: std::time::Duration,
    pub retry: RetryStrategyConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            update_base_url: "https://update.example.com/api".to_string(),
            gallery_base_url: "https://marketplace.example.com/api".to_string(),
            request_timeout: std::time::Duration::from_secs(30),
            retry: gallery_mirror_retry::RetryPolicy::Default.to_config(),
        }
    }
}

/// Thin async client over the upstream HTTP APIs.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

fn classify_transport_error(error: &reqwest::Error) -> ErrorClass {
    if error.is_timeout() || error.is_connect() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
    if status.as_u16() == 429 || status.is_server_error() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

/// Redirects followed per request before giving up (spec §4.2).
const MAX_REDIRECTS: usize = 5;

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("gallery-mirror/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn request_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let executor = RetryExecutor::new(self.config.retry.clone());
        let response = executor
            .run(
                |e: &(Error, ErrorClass)| e.1,
                |attempt| {
                    let url = url.to_string();
                    let http = self.http.clone();
                    async move {
                        debug!(url = %url, attempt, "fetching upstream resource");
                        let result = http.get(&url).send().await;
                        match result {
                            Ok(response) if response.status().is_success() => Ok(response),
                            Ok(response) => {
                                let class = classify_status(response.status());
                                warn!(url = %url, status = %response.status(), attempt, "upstream returned non-success status");
                                Err((Error::UpstreamUnavailable(format!(
                                    "{url} returned {}",
                                    response.status()
                                )), class))
                            }
                            Err(e) => {
                                let class = classify_transport_error(&e);
                                warn!(url = %url, error = %e, attempt, "upstream request failed");
                                Err((Error::UpstreamUnavailable(format!("{url}: {e}")), class))
                            }
                        }
                    }
                },
            )
            .await
            .map_err(|(error, _class)| error)?;

        response
            .json::<T>()
            .await
            .map_err(|e| Error::UpstreamMalformed(format!("{url}: {e}")))
    }

    /// Fetch the current release for a quality channel and platform.
    pub async fn fetch_binary_release(&self, quality: Quality, platform: &str) -> Result<BinaryRelease> {
        let url = format!(
            "{}/commits/{quality}/{platform}/latest",
            self.config.update_base_url
        );
        self.request_json(&url).await
    }

    /// Run an extension query against the upstream gallery. The response is
    /// in the upstream's own raw shape (CDN asset URLs, no local paths) —
    /// callers convert it into planning input themselves.
    pub async fn fetch_extension_query(&self, request: &ExtensionQueryRequest) -> Result<RawExtensionQueryResult> {
        let url = format!("{}/extensionquery", self.config.gallery_base_url);
        let executor = RetryExecutor::new(self.config.retry.clone());
        let response = executor
            .run(
                |e: &(Error, ErrorClass)| e.1,
                |attempt| {
                    let url = url.clone();
                    let http = self.http.clone();
                    async move {
                        debug!(url = %url, attempt, "posting extension query");
                        match http.post(&url).json(request).send().await {
                            Ok(response) if response.status().is_success() => Ok(response),
                            Ok(response) => {
                                let class = classify_status(response.status());
                                Err((
                                    Error::UpstreamUnavailable(format!(
                                        "{url} returned {}",
                                        response.status()
                                    )),
                                    class,
                                ))
                            }
                            Err(e) => {
                                let class = classify_transport_error(&e);
                                Err((Error::UpstreamUnavailable(format!("{url}: {e}")), class))
                            }
                        }
                    }
                },
            )
            .await
            .map_err(|(error, _class)| error)?;

        response
            .json::<RawExtensionQueryResult>()
            .await
            .map_err(|e| Error::UpstreamMalformed(format!("{url}: {e}")))
    }

    /// Fetch the upstream's recommended-extensions list.
    pub async fn fetch_recommended_identifiers(&self) -> Result<Vec<String>> {
        let url = format!("{}/extensions/recommendations", self.config.gallery_base_url);
        self.request_json(&url).await
    }

    /// Issue a GET for an asset (VSIX package, icon, etc.) and return the
    /// validated response once its status is known to be successful,
    /// retrying transient failures. The caller streams the body itself,
    /// since only it knows how to reset a partially written destination
    /// before a retried attempt.
    pub async fn begin_download(&self, url: &str) -> Result<reqwest::Response> {
        let executor = RetryExecutor::new(self.config.retry.clone());
        executor
            .run(
                |e: &(Error, ErrorClass)| e.1,
                |attempt| {
                    let url = url.to_string();
                    let http = self.http.clone();
                    async move {
                        debug!(url = %url, attempt, "requesting asset");
                        match http.get(&url).send().await {
                            Ok(response) if response.status().is_success() => Ok(response),
                            Ok(response) => {
                                let class = classify_status(response.status());
                                warn!(url = %url, status = %response.status(), attempt, "asset request returned non-success status");
                                Err((
                                    Error::UpstreamUnavailable(format!(
                                        "{url} returned {}",
                                        response.status()
                                    )),
                                    class,
                                ))
                            }
                            Err(e) => {
                                let class = classify_transport_error(&e);
                                warn!(url = %url, error = %e, attempt, "asset request failed");
                                Err((Error::UpstreamUnavailable(format!("{url}: {e}")), class))
                            }
                        }
                    }
                },
            )
            .await
            .map_err(|(error, _class)| error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_errors_and_rate_limits_as_retryable() {
        assert_eq!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            ErrorClass::Retryable
        );
        assert_eq!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS), ErrorClass::Retryable);
        assert_eq!(classify_status(reqwest::StatusCode::NOT_FOUND), ErrorClass::Permanent);
        assert_eq!(classify_status(reqwest::StatusCode::FORBIDDEN), ErrorClass::Permanent);
    }
}
