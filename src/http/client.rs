//! Sales API client
//!
//! Issues one GET per page and classifies the outcome:
//! - 200 with a decodable body is a page
//! - 429 is a rate limit, honouring `Retry-After`
//! - timeouts, connection failures, 408 and 5xx are transient
//! - everything else is fatal
//!
//! Retrying is the engine's job, not the client's.

use super::rate_limit::{RateLimiter, RateLimiterConfig};
use super::source::{FetchError, FetchResult, PageResult, PageSource};
use crate::decode::{DecoderConfig, PageDecoder};
use crate::error::{Error, Result};
use crate::retry::FailureKind;
use crate::types::Cursor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Connection settings for the sales API
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.example.com/v2/`
    pub base_url: String,

    /// Path of the sales endpoint, relative to the base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable to read the API key from at load time
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Prefix put before the key (`Bearer`), if any
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: Option<String>,

    /// Query parameter holding the cursor
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,

    /// Query parameter holding the page size
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Extra query parameters sent with every request
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Client-side throttle; `None` disables it
    #[serde(default)]
    pub rate_limit: Option<RateLimiterConfig>,

    /// Response layout
    #[serde(default)]
    pub response: DecoderConfig,
}

fn default_endpoint() -> String {
    "sales".to_string()
}

fn default_api_key_header() -> String {
    "Authorization".to_string()
}

fn default_api_key_prefix() -> Option<String> {
    Some("Bearer".to_string())
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_page_size_param() -> String {
    "limit".to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("salesync/{}", env!("CARGO_PKG_VERSION"))
}

impl ApiConfig {
    /// Config for `base_url` with every other field at its default
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint: default_endpoint(),
            api_key: None,
            api_key_env: None,
            api_key_header: default_api_key_header(),
            api_key_prefix: default_api_key_prefix(),
            cursor_param: default_cursor_param(),
            page_size_param: default_page_size_param(),
            page_size: default_page_size(),
            query: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            rate_limit: None,
            response: DecoderConfig::default(),
        }
    }

    /// Set the endpoint path
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the API key
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the page size
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the request timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Enable the client-side throttle
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Set the response layout
    #[must_use]
    pub fn response(mut self, decoder: DecoderConfig) -> Self {
        self.response = decoder;
        self
    }

    /// Fill `api_key` from `api_key_env` when no inline key is set
    pub fn resolve_api_key(&mut self) -> Result<()> {
        if self.api_key.is_some() {
            return Ok(());
        }
        if let Some(var) = &self.api_key_env {
            let value = std::env::var(var).map_err(|_| {
                Error::invalid_value("api.api_key_env", format!("environment variable {var} is not set"))
            })?;
            self.api_key = Some(value);
        }
        Ok(())
    }

    /// Full endpoint URL
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut base = Url::parse(&self.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(self.endpoint.trim_start_matches('/'))?)
    }

    fn auth_header_value(&self) -> Option<String> {
        let key = self.api_key.as_deref()?;
        Some(match self.api_key_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix} {key}"),
            _ => key.to_string(),
        })
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("page_size", &self.page_size)
            .field("timeout_secs", &self.timeout_secs)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

/// HTTP implementation of [`PageSource`]
pub struct SalesApiClient {
    client: Client,
    config: ApiConfig,
    url: Url,
    decoder: PageDecoder,
    rate_limiter: Option<RateLimiter>,
}

impl SalesApiClient {
    /// Build a client; fails on an unusable base URL
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        let url = config.endpoint_url()?;
        let rate_limiter = config.rate_limit.as_ref().map(RateLimiter::new);
        let decoder = PageDecoder::new(config.response.clone());

        Ok(Self {
            client,
            config,
            url,
            decoder,
            rate_limiter,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Endpoint the client calls
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Check if client-side throttling is enabled
    pub fn has_rate_limiter(&self) -> bool {
        self.rate_limiter.is_some()
    }

    async fn handle_response(&self, response: Response) -> FetchResult {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = extract_retry_after(&response);
            warn!(retry_after_secs = ?retry_after.map(|d| d.as_secs()), "Rate limited (429)");
            return Err(FetchError::rate_limited(retry_after));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::classify(Error::http_status(status.as_u16(), body)));
        }

        // a body cut off mid-stream is worth another try
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::new(FailureKind::Transient, Error::Http(e)))?;

        let page = self
            .decoder
            .decode(&body)
            .map_err(|e| FetchError::new(FailureKind::Fatal, e))?;

        Ok(PageResult::new(page.records, page.next_cursor))
    }
}

#[async_trait]
impl PageSource for SalesApiClient {
    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: u32) -> FetchResult {
        if let Some(ref limiter) = self.rate_limiter {
            limiter.wait().await;
        }

        let mut req = self
            .client
            .get(self.url.clone())
            .query(&[(self.config.page_size_param.as_str(), page_size.to_string())]);

        if let Some(cursor) = cursor {
            req = req.query(&[(self.config.cursor_param.as_str(), cursor.as_str())]);
        }
        if !self.config.query.is_empty() {
            req = req.query(&self.config.query);
        }
        if let Some(value) = self.config.auth_header_value() {
            req = req.header(self.config.api_key_header.as_str(), value);
        }

        debug!(url = %self.url, cursor = cursor.map_or("", Cursor::as_str), page_size, "Fetching page");

        match req.send().await {
            Ok(response) => self.handle_response(response).await,
            Err(e) => Err(FetchError::classify(Error::Http(e))),
        }
    }
}

impl std::fmt::Debug for SalesApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalesApiClient")
            .field("url", &self.url.as_str())
            .field("config", &self.config)
            .field("has_rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
fn extract_retry_after(response: &Response) -> Option<Duration> {
    let raw = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
}
