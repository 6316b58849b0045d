// Feed Fetcher: HTTP GET of the raw feed bytes with bounded retry.
// Network I/O only; never touches the cache.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Upstream responded with {status_code}: {url}")]
    HttpStatus { status_code: u16, url: String },

    #[error("Fetch budget of {budget_ms}ms exhausted after {attempts} attempt(s): {last_error}")]
    BudgetExhausted {
        budget_ms: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Client error: {0}")]
    ClientError(String),
}

impl FetchError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::NetworkError(_) | FetchError::Timeout(_) => true,
            FetchError::HttpStatus { status_code, .. } => {
                *status_code >= 500 || *status_code == 408 || *status_code == 429
            }
            FetchError::BudgetExhausted { .. } | FetchError::ClientError(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff_ms: 250,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Upper bound for a single HTTP attempt.
    pub timeout: Duration,
    /// Upper bound for all attempts of one `fetch`, backoff included.
    pub total_budget: Duration,
    pub user_agent: String,
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            total_budget: Duration::from_secs(10),
            user_agent: concat!("property-feed/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Source of raw feed documents. The HTTP implementation is the production
/// one; tests plug in canned or counting sources.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Exponential backoff with jitter for retry number `retry_attempt` (0-based).
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl HttpFeedFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::ClientError(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn fetch_once(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                FetchError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                FetchError::NetworkError(e.to_string())
            }
        })
    }
}

fn status_error(status: StatusCode, url: &str) -> FetchError {
    FetchError::HttpStatus {
        status_code: status.as_u16(),
        url: url.to_string(),
    }
}

#[async_trait]
impl FeedSource for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let budget = self.config.total_budget;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = budget.saturating_sub(started.elapsed());
            let result = match tokio::time::timeout(remaining, self.fetch_once(url)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(FetchError::BudgetExhausted {
                        budget_ms: budget.as_millis() as u64,
                        attempts,
                        last_error: "attempt cut off by budget".to_string(),
                    })
                }
            };

            let err = match result {
                Ok(bytes) => {
                    debug!(url, attempts, bytes = bytes.len(), "feed fetched");
                    return Ok(bytes);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempts > self.config.retry.max_retries {
                return Err(err);
            }

            let backoff = calculate_backoff(attempts - 1, &self.config.retry);
            if started.elapsed() + backoff >= budget {
                return Err(FetchError::BudgetExhausted {
                    budget_ms: budget.as_millis() as u64,
                    attempts,
                    last_error: err.to_string(),
                });
            }

            warn!(url, attempts, error = %err, backoff_ms = backoff.as_millis() as u64, "feed fetch failed, retrying");
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Minimal one-shot HTTP server: answers each connection with the next
    // canned response.
    async fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/feed.xml", addr)
    }

    const OK_RESPONSE: &str =
        "HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\n<kyero></kyero>\r\n";
    const UNAVAILABLE_RESPONSE: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const NOT_FOUND_RESPONSE: &str =
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    fn fast_config() -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(2),
            total_budget: Duration::from_secs(5),
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 10,
                max_backoff_ms: 20,
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
            },
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let url = serve(vec![OK_RESPONSE]).await;
        let fetcher = HttpFeedFetcher::new(fast_config()).unwrap();
        let bytes = fetcher.fetch(&url).await.unwrap();
        assert!(bytes.starts_with(b"<kyero>"));
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_status() {
        let url = serve(vec![UNAVAILABLE_RESPONSE, OK_RESPONSE]).await;
        let fetcher = HttpFeedFetcher::new(fast_config()).unwrap();
        let bytes = fetcher.fetch(&url).await.unwrap();
        assert!(bytes.starts_with(b"<kyero>"));
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_retries() {
        let url = serve(vec![UNAVAILABLE_RESPONSE, UNAVAILABLE_RESPONSE]).await;
        let fetcher = HttpFeedFetcher::new(fast_config()).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::HttpStatus {
                status_code: 503,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_client_errors() {
        // Only one response queued; a retry would hang until the budget ran out.
        let url = serve(vec![NOT_FOUND_RESPONSE]).await;
        let fetcher = HttpFeedFetcher::new(fast_config()).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::HttpStatus {
                status_code: 404,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_respects_total_budget() {
        // Accepts the connection and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = FetchConfig {
            timeout: Duration::from_secs(10),
            total_budget: Duration::from_millis(200),
            ..fast_config()
        };
        let fetcher = HttpFeedFetcher::new(config).unwrap();
        let started = Instant::now();
        let err = fetcher
            .fetch(&format!("http://{}/feed.xml", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BudgetExhausted { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test_case(FetchError::NetworkError("reset".into()), true)]
    #[test_case(FetchError::Timeout(5000), true)]
    #[test_case(FetchError::HttpStatus { status_code: 502, url: "u".into() }, true)]
    #[test_case(FetchError::HttpStatus { status_code: 429, url: "u".into() }, true)]
    #[test_case(FetchError::HttpStatus { status_code: 404, url: "u".into() }, false)]
    #[test_case(FetchError::ClientError("tls".into()), false)]
    fn test_is_retryable(err: FetchError, expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = RetryConfig::default();
        for attempt in 0..10 {
            let backoff = calculate_backoff(attempt, &config);
            let max = config.max_backoff_ms as f64 * (1.0 + config.jitter_factor / 2.0);
            assert!(backoff.as_millis() as f64 <= max);
        }
        let first = calculate_backoff(0, &config).as_millis() as f64;
        assert!(first >= config.initial_backoff_ms as f64 * (1.0 - config.jitter_factor / 2.0) - 1.0);
    }
}

#[cfg(test)]
pub mod mock_source {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Nine listings across every region, one unmapped town (Gandia) and one
    /// listing outside the covered area (Vera, Almería).
    pub const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<root>
  <kyero><feed_version>3</feed_version></kyero>
  <property>
    <ref>CB-001</ref><type>Villa</type><town>Algorfa</town><province>Alicante</province>
    <price>189000</price><beds>3</beds><baths>2</baths>
    <surface_area><built>120</built><plot>400</plot></surface_area>
    <images><image id="1"><url>https://img.test/cb001-1.jpg</url></image></images>
    <features><feature>Private pool</feature><feature>Garden</feature></features>
  </property>
  <property>
    <ref>CB-002</ref><type>Apartment</type><town>Torrevieja</town><province>Alicante</province>
    <price>145000</price><beds>2</beds><baths>1</baths>
  </property>
  <property>
    <ref>CB-003</ref><type>Villa</type><town>Polop</town><province>Alicante</province>
    <price>425000</price><beds>4</beds><baths>3</baths>
    <features><feature>Sea views</feature><feature>Private pool</feature></features>
  </property>
  <property>
    <ref>CB-004</ref><type>Townhouse</type><town>Sucina</town><province>Murcia</province>
    <price>210000</price><beds>3</beds><baths>2</baths><new_build>1</new_build>
  </property>
  <property>
    <ref>CB-005</ref><type>Penthouse</type><town>Benidorm</town><province>Alicante</province>
    <price></price><beds>2</beds>
  </property>
  <property>
    <ref>CB-006</ref><type>Bungalow</type><town>Rojales</town><province>Alicante</province>
    <price>99000</price><beds>2</beds><baths>1</baths>
  </property>
  <property>
    <ref>CB-007</ref><type>Apartment</type><town>La Manga</town><province>Murcia</province>
    <price>175000</price><beds>2</beds>
  </property>
  <property>
    <ref>CB-008</ref><type>Apartment</type><town>Gandia</town>
    <price>120000</price><beds>1</beds>
  </property>
  <property>
    <ref>CB-009</ref><type>Villa</type><town>Vera</town><province>Almería</province>
    <price>230000</price><beds>3</beds>
  </property>
</root>"#;

    /// In-memory feed source that counts fetches. Responses can be swapped
    /// while a test runs.
    pub struct MockFeedSource {
        default_response: Mutex<Result<Bytes, FetchError>>,
        per_url: Mutex<HashMap<String, Result<Bytes, FetchError>>>,
        delay_ms: AtomicU64,
        panicking: AtomicBool,
        fetch_count: AtomicUsize,
    }

    impl MockFeedSource {
        pub fn new(body: &str) -> Self {
            Self::with_response(Ok(Bytes::from(body.to_string())))
        }

        pub fn failing(error: FetchError) -> Self {
            Self::with_response(Err(error))
        }

        fn with_response(response: Result<Bytes, FetchError>) -> Self {
            Self {
                default_response: Mutex::new(response),
                per_url: Mutex::new(HashMap::new()),
                delay_ms: AtomicU64::new(0),
                panicking: AtomicBool::new(false),
                fetch_count: AtomicUsize::new(0),
            }
        }

        pub fn set_body(&self, body: &str) {
            *self.default_response.lock() = Ok(Bytes::from(body.to_string()));
        }

        pub fn set_failure(&self, error: FetchError) {
            *self.default_response.lock() = Err(error);
        }

        pub fn set_url_body(&self, url: &str, body: &str) {
            self.per_url
                .lock()
                .insert(url.to_string(), Ok(Bytes::from(body.to_string())));
        }

        pub fn set_url_failure(&self, url: &str, error: FetchError) {
            self.per_url.lock().insert(url.to_string(), Err(error));
        }

        pub fn set_delay(&self, delay: Duration) {
            self.delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        /// While set, every fetch panics instead of answering.
        pub fn set_panicking(&self, panicking: bool) {
            self.panicking.store(panicking, Ordering::SeqCst);
        }

        pub fn fetch_count(&self) -> usize {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeedSource for MockFeedSource {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.panicking.load(Ordering::SeqCst) {
                panic!("feed source bug");
            }
            let per_url = self.per_url.lock().get(url).cloned();
            match per_url {
                Some(response) => response,
                None => self.default_response.lock().clone(),
            }
        }
    }
}
