//! Client for NewsNow-style hot-list APIs.
//!
//! The endpoint returns `{"items": [{"title", "url", "mobileUrl", "hotValue"}]}`
//! for a platform id substituted into the configured URL template.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use trendradar_shared::{ItemMetadata, PlatformConfig, RawItem, Result, TrendRadarError};

use crate::{FetchOptions, Scraper, normalize_title};

/// User-Agent string for hot-list requests.
const USER_AGENT: &str = concat!("TrendRadar/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HotListResponse {
    #[serde(default)]
    items: Vec<HotListEntry>,
}

#[derive(Debug, Deserialize)]
struct HotListEntry {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "mobileUrl")]
    mobile_url: Option<String>,
    /// Numeric on most platforms, a display string ("1.2万") on some.
    #[serde(default, rename = "hotValue")]
    hot_value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// NewsNowScraper
// ---------------------------------------------------------------------------

/// Fetches hot lists from an endpoint template containing `{id}`.
pub struct NewsNowScraper {
    client: Client,
    endpoint: String,
}

impl NewsNowScraper {
    /// Create a scraper for `endpoint` (e.g. `https://host/api/s?id={id}&latest`).
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        if !endpoint.contains("{id}") {
            return Err(TrendRadarError::config(format!(
                "hot-list endpoint '{endpoint}' has no {{id}} placeholder"
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| TrendRadarError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }

    /// Resolve the request URL for a platform.
    pub fn platform_url(&self, platform_id: &str) -> Result<Url> {
        let encoded: String = url::form_urlencoded::byte_serialize(platform_id.as_bytes()).collect();
        let raw = self.endpoint.replace("{id}", &encoded);
        Url::parse(&raw).map_err(|e| TrendRadarError::config(format!("invalid endpoint {raw}: {e}")))
    }

    /// `scheme://host/` of the endpoint, sent as `Referer`.
    fn referer(url: &Url) -> Option<HeaderValue> {
        let origin = url.origin().ascii_serialization();
        HeaderValue::from_str(&format!("{origin}/")).ok()
    }
}

#[async_trait]
impl Scraper for NewsNowScraper {
    #[instrument(skip_all, fields(platform = %platform.id))]
    async fn fetch(
        &self,
        platform: &PlatformConfig,
        options: &FetchOptions,
    ) -> Result<Vec<RawItem>> {
        let url = self.platform_url(&platform.id)?;
        debug!(%url, "fetching hot list");

        let mut request = self.client.get(url.as_str()).timeout(options.timeout);
        if let Some(referer) = Self::referer(&url) {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TrendRadarError::timeout(format!("fetch {}", platform.id), options.timeout)
            } else {
                TrendRadarError::Network(format!("{}: {e}", platform.id))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrendRadarError::Network(format!(
                "{}: HTTP {status}",
                platform.id
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TrendRadarError::Network(format!("{}: body read failed: {e}", platform.id)))?;

        let parsed: HotListResponse = serde_json::from_str(&body).map_err(|e| {
            TrendRadarError::parse(format!("{}: malformed hot list: {e}", platform.id))
        })?;

        let items = to_raw_items(platform, parsed.items, options.max_items);
        debug!(count = items.len(), "hot list parsed");
        Ok(items)
    }
}

fn to_raw_items(
    platform: &PlatformConfig,
    entries: Vec<HotListEntry>,
    max_items: usize,
) -> Vec<RawItem> {
    let fetched_at = Utc::now();
    entries
        .into_iter()
        .take(max_items)
        .enumerate()
        .filter_map(|(idx, entry)| {
            let title = normalize_title(entry.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                return None;
            }
            Some(RawItem {
                platform: platform.id.clone(),
                title,
                rank: idx as u32 + 1,
                url: entry.url.unwrap_or_default(),
                fetched_at,
                metadata: Some(ItemMetadata {
                    platform_name: Some(platform.display_name().to_string()),
                    mobile_url: entry.mobile_url.filter(|u| !u.is_empty()),
                    hot_value: entry.hot_value.as_ref().and_then(parse_hot_value),
                }),
            })
        })
        .collect()
}

/// Interpret a heat value: plain numbers, numeric strings, or strings with a
/// `万` (10^4) / `亿` (10^8) suffix.
fn parse_hot_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let s = s.trim().replace(',', "");
            let (digits, scale) = if let Some(rest) = s.strip_suffix('万') {
                (rest, 1e4)
            } else if let Some(rest) = s.strip_suffix('亿') {
                (rest, 1e8)
            } else {
                (s.as_str(), 1.0)
            };
            digits.trim().parse::<f64>().ok().map(|v| v * scale)
        }
        _ => None,
    }
}
