//! Carrier registry + the fetchers that read a tracking page's current status.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use trackrec_fetch::{FetchError, Fetcher};
use url::{form_urlencoded, Url};

pub const CRATE_NAME: &str = "trackrec-adapters";

pub const TRACKING_ID_PLACEHOLDER: &str = "{tracking_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierMode {
    Html,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarrierRegistry {
    pub carriers: Vec<CarrierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarrierConfig {
    pub carrier_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: CarrierMode,
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Tried in order; the first selector with non-empty text wins.
    #[serde(default)]
    pub status_selectors: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("parsing fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown carrier `{0}`")]
    UnknownCarrier(String),
    #[error("carrier `{0}` is disabled in the registry")]
    Disabled(String),
    #[error("invalid status selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("carrier `{carrier_id}` is misconfigured: {reason}")]
    Misconfigured { carrier_id: String, reason: String },
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl CarrierRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| AdapterError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn find(&self, carrier_id: &str) -> Option<&CarrierConfig> {
        self.carriers.iter().find(|c| c.carrier_id == carrier_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CarrierConfig> {
        self.carriers.iter().filter(|c| c.enabled)
    }
}

/// Ordered CSS selectors that locate the current-status text on a tracking page.
#[derive(Debug, Clone)]
pub struct StatusExtractor {
    selectors: Vec<Selector>,
}

impl StatusExtractor {
    pub fn new(selectors: &[String]) -> Result<Self, AdapterError> {
        let selectors = selectors
            .iter()
            .map(|raw| {
                Selector::parse(raw).map_err(|e| AdapterError::InvalidSelector {
                    selector: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { selectors })
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// Returns the first non-empty text matched, whitespace-collapsed.
    pub fn extract(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        self.selectors.iter().find_map(|selector| {
            document
                .select(selector)
                .filter_map(|node| text_or_none(node.text().collect::<String>()))
                .next()
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Server faults and throttling are carrier-side failures; any other
/// non-success status means the carrier rejected this request. Both retry.
fn status_failure(status: StatusCode) -> FetchError {
    let reason = format!("http status {}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::Failed(reason)
    } else {
        FetchError::Rejected(reason)
    }
}

fn request_failure(err: &reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Failed(err.to_string())
    }
}

/// Reads a carrier's public tracking page and pulls the status text out of it.
pub struct HtmlStatusFetcher {
    carrier_id: String,
    client: reqwest::Client,
    url_template: String,
    extractor: StatusExtractor,
}

impl HtmlStatusFetcher {
    pub fn new(config: &CarrierConfig) -> Result<Self, AdapterError> {
        let misconfigured = |reason: &str| AdapterError::Misconfigured {
            carrier_id: config.carrier_id.clone(),
            reason: reason.to_string(),
        };
        let url_template = config
            .url_template
            .clone()
            .ok_or_else(|| misconfigured("html mode needs url_template"))?;
        if !url_template.contains(TRACKING_ID_PLACEHOLDER) {
            return Err(misconfigured("url_template lacks {tracking_id}"));
        }
        if Url::parse(&url_template.replace(TRACKING_ID_PLACEHOLDER, "0")).is_err() {
            return Err(misconfigured("url_template is not an absolute URL"));
        }
        let extractor = StatusExtractor::new(&config.status_selectors)?;
        if extractor.is_empty() {
            return Err(misconfigured("html mode needs at least one status selector"));
        }

        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            carrier_id: config.carrier_id.clone(),
            client: builder.build()?,
            url_template,
            extractor,
        })
    }

    /// Substitutes the form-encoded tracking id into the template.
    pub fn url_for(&self, tracking_id: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(tracking_id.trim().as_bytes()).collect();
        self.url_template.replace(TRACKING_ID_PLACEHOLDER, &encoded)
    }
}

#[async_trait]
impl Fetcher for HtmlStatusFetcher {
    fn name(&self) -> &str {
        &self.carrier_id
    }

    async fn fetch(&self, tracking_id: &str, timeout: Duration) -> Result<String, FetchError> {
        let url = self.url_for(tracking_id);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| request_failure(&err, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_failure(status));
        }
        let body = response
            .text()
            .await
            .map_err(|err| request_failure(&err, timeout))?;

        let found = self.extractor.extract(&body);
        debug!(carrier = %self.carrier_id, %url, found = found.is_some(), "tracking page parsed");
        Ok(found.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureEntry {
    Text(String),
    Page { page: PathBuf },
}

/// Offline fetcher answering from a JSON fixture of `tracking_id -> status`.
///
/// Entries are either the status text itself or `{"page": "<relative html>"}`,
/// in which case the page is run through the carrier's selectors. Ids missing
/// from the fixture come back empty.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    carrier_id: String,
    statuses: HashMap<String, String>,
}

impl FixtureFetcher {
    pub fn from_statuses(
        carrier_id: impl Into<String>,
        statuses: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            carrier_id: carrier_id.into(),
            statuses: statuses.into_iter().collect(),
        }
    }

    pub fn load(
        carrier_id: impl Into<String>,
        path: impl AsRef<Path>,
        extractor: &StatusExtractor,
    ) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: HashMap<String, FixtureEntry> =
            serde_json::from_str(&text).map_err(|source| AdapterError::Fixture {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut statuses = HashMap::with_capacity(entries.len());
        for (tracking_id, entry) in entries {
            let status = match entry {
                FixtureEntry::Text(text) => text,
                FixtureEntry::Page { page } => {
                    let page_path = base.join(page);
                    let html = fs::read_to_string(&page_path).map_err(|source| AdapterError::Io {
                        path: page_path.clone(),
                        source,
                    })?;
                    extractor.extract(&html).unwrap_or_default()
                }
            };
            statuses.insert(tracking_id, status);
        }
        Ok(Self::from_statuses(carrier_id, statuses))
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    fn name(&self) -> &str {
        &self.carrier_id
    }

    async fn fetch(&self, tracking_id: &str, _timeout: Duration) -> Result<String, FetchError> {
        Ok(self
            .statuses
            .get(tracking_id.trim())
            .cloned()
            .unwrap_or_default())
    }
}

/// Builds the fetcher registered for `carrier_id`. Fixture paths resolve
/// against `workspace_root`.
pub fn fetcher_for_carrier(
    registry: &CarrierRegistry,
    carrier_id: &str,
    workspace_root: &Path,
) -> Result<Arc<dyn Fetcher>, AdapterError> {
    let config = registry
        .find(carrier_id)
        .ok_or_else(|| AdapterError::UnknownCarrier(carrier_id.to_string()))?;
    if !config.enabled {
        return Err(AdapterError::Disabled(carrier_id.to_string()));
    }

    let fetcher: Arc<dyn Fetcher> = match config.mode {
        CarrierMode::Html => Arc::new(HtmlStatusFetcher::new(config)?),
        CarrierMode::Fixture => {
            let path = config
                .fixture_path
                .as_ref()
                .ok_or_else(|| AdapterError::Misconfigured {
                    carrier_id: carrier_id.to_string(),
                    reason: "fixture mode needs fixture_path".to_string(),
                })?;
            let extractor = StatusExtractor::new(&config.status_selectors)?;
            Arc::new(FixtureFetcher::load(
                carrier_id,
                workspace_root.join(path),
                &extractor,
            )?)
        }
    };
    info!(carrier = carrier_id, mode = ?config.mode, "carrier fetcher ready");
    Ok(fetcher)
}
