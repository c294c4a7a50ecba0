//! # BOM API Fetching
//!
//! This module performs the network side of a poll cycle: one HTTP GET per
//! feed against the Bureau of Meteorology's public location API.
//!
//! ## Endpoints
//! All feeds hang off the same geohash-keyed location:
//! - `GET {base}/locations/{geohash}/observations`
//! - `GET {base}/locations/{geohash}/forecasts/daily`
//! - `GET {base}/locations/{geohash}/warnings`
//! - `GET {base}/locations/{geohash}` (place name lookup)
//!
//! ## Error Handling
//! Every failure is reported as a [`FetchError`] and none of them is fatal:
//! the scheduler treats it as "this feed did not update this cycle" and the
//! next tick is the retry.
//!
//! Requests are bounded by a per-request timeout and a body size cap. BOM
//! payloads are a few kilobytes; anything much larger is not a response this
//! device should be buffering.

use crate::config::ProviderSettings;
use crate::FeedKind;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Unparsed response body of a successful request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPayload(String);

impl RawPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self(body.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reasons a single feed request produced no payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// DNS, connect, TLS or transport failure
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("empty response body")]
    EmptyBody,

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus(status.as_u16())
        } else {
            FetchError::NetworkUnavailable(err.to_string())
        }
    }
}

/// Anything that can deliver raw feed payloads for a geohash.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch one feed for `geohash`.
    async fn fetch(&self, kind: FeedKind, geohash: &str) -> Result<RawPayload, FetchError>;

    /// Fetch the location record (place name) for `geohash`.
    async fn fetch_location(&self, geohash: &str) -> Result<RawPayload, FetchError>;
}

/// HTTP client for the BOM location API.
#[derive(Clone, Debug)]
pub struct BomClient {
    http: reqwest::Client,
    base_url: String,
    max_body_bytes: usize,
}

impl BomClient {
    /// Build a client with the configured timeout.
    pub fn new(settings: &ProviderSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(5)))
            .user_agent(concat!("weather-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_body_bytes: settings.max_body_bytes,
        })
    }

    pub fn feed_url(&self, kind: FeedKind, geohash: &str) -> String {
        format!("{}/locations/{}/{}", self.base_url, geohash, kind.endpoint())
    }

    pub fn location_url(&self, geohash: &str) -> String {
        format!("{}/locations/{}", self.base_url, geohash)
    }

    async fn get(&self, url: &str) -> Result<RawPayload, FetchError> {
        log::debug!("GET {}", url);
        let mut response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Non-200 status {} for {}", status.as_u16(), url);
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let limit = self.max_body_bytes;
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                log::warn!("Content-Length {} > {} for {}, skipping", len, limit, url);
                return Err(FetchError::BodyTooLarge { limit });
            }
        }

        // Chunked responses carry no Content-Length, so count as we read
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if let Err(e) = append_capped(&mut body, &chunk, limit) {
                log::warn!("Response for {} exceeded {} bytes", url, limit);
                return Err(e);
            }
        }

        let text = String::from_utf8_lossy(&body);
        if text.trim().is_empty() {
            log::warn!("Empty response for {}", url);
            return Err(FetchError::EmptyBody);
        }
        log::debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(RawPayload::new(text))
    }
}

/// Append `chunk` to `body` unless that would take it past `limit` bytes.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> Result<(), FetchError> {
    if body.len() + chunk.len() > limit {
        return Err(FetchError::BodyTooLarge { limit });
    }
    body.extend_from_slice(chunk);
    Ok(())
}

#[async_trait]
impl FeedSource for BomClient {
    async fn fetch(&self, kind: FeedKind, geohash: &str) -> Result<RawPayload, FetchError> {
        self.get(&self.feed_url(kind, geohash)).await
    }

    async fn fetch_location(&self, geohash: &str) -> Result<RawPayload, FetchError> {
        self.get(&self.location_url(geohash)).await
    }
}
