// Feed configuration: feed URLs and cache lifetime read from the environment,
// with a `.env` file honoured when present.

use crate::cache::CacheConfig;
use crate::fetcher::FetchConfig;
use crate::pipeline::PipelineOptions;
use reqwest::Url;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const FEED_URLS_VAR: &str = "PROPERTY_FEED_URLS";
pub const CACHE_TTL_VAR: &str = "PROPERTY_FEED_CACHE_TTL_SECS";

/// Everything needed to wire up a catalog: where the feeds live, how long a
/// snapshot stays fresh and how patient the fetcher is.
#[derive(Debug, Clone, Default)]
pub struct FeedConfig {
    pub feed_urls: Vec<String>,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub pipeline: PipelineOptions,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PROPERTY_FEED_URLS must list at least one feed URL")]
    MissingFeedUrls,

    #[error("PROPERTY_FEED_CACHE_TTL_SECS must be a positive number of seconds, got {0:?}")]
    InvalidTtl(String),

    #[error("Invalid feed URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FeedConfig {
    pub fn new(feed_urls: Vec<String>) -> Self {
        Self {
            feed_urls,
            ..Self::default()
        }
    }

    /// Load from the process environment, reading a `.env` file first if
    /// one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let feed_urls = parse_feed_urls(&lookup(FEED_URLS_VAR).unwrap_or_default())?;

        let mut config = Self::new(feed_urls);
        if let Some(raw) = lookup(CACHE_TTL_VAR).filter(|v| !v.trim().is_empty()) {
            config.cache.ttl = parse_ttl(&raw)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed_urls.is_empty() {
            return Err(ConfigError::MissingFeedUrls);
        }
        for url in &self.feed_urls {
            validate_url(url)?;
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::InvalidTtl("0".to_string()));
        }
        Ok(())
    }
}

fn parse_feed_urls(raw: &str) -> Result<Vec<String>, ConfigError> {
    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();

    if urls.is_empty() {
        return Err(ConfigError::MissingFeedUrls);
    }
    for url in &urls {
        validate_url(url)?;
    }
    Ok(urls)
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

fn parse_ttl(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidTtl(raw.to_string())),
    }
}
