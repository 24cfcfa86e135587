//! Rate-limited HTTP fetch, paged collection, and the persistence gateway for Polis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub mod memory;
pub mod paging;
pub mod pg;
pub mod store;

pub use memory::MemoryStore;
pub use paging::{
    collect_adaptive, collect_linked, AdaptiveOptions, AdaptiveOutcome, CeilingSource, Envelope, Link, PageUrl,
};
pub use pg::PgStore;
pub use store::{DocumentStore, PersonFilter, PersonUpsert, StoreError, StoredFact, UpsertOutcome};

pub const CRATE_NAME: &str = "polis-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for a single call. The default performs no retries: failed
/// items are picked up again by the next periodic run.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Token bucket shared by every fetcher that talks to one external system.
///
/// Waiters queue on the inner mutex, so request issuance is serialized at the
/// configured rate while responses are awaited concurrently.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// One token, refilled `requests_per_second` times a second.
    pub fn per_second(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        Self::new(1, Duration::from_secs(1) / rps)
    }

    pub fn refill_every(&self) -> Duration {
        self.refill_every
    }

    pub async fn take(&self) {
        let mut state = self.state.lock().await;
        loop {
            if self.refill_every.is_zero() {
                return;
            }
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
                if state.tokens == self.capacity {
                    state.last_refill = Instant::now();
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(state.last_refill.elapsed());
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("timed out after {after:?} waiting for {url}")]
    Timeout { url: String, after: Duration },
}

impl FetchError {
    /// Transport-level failures worth retrying; decode errors and 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Decode { .. } => false,
            FetchError::Timeout { .. } => true,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Request { url, .. }
            | FetchError::HttpStatus { url, .. }
            | FetchError::Decode { url, .. }
            | FetchError::Timeout { url, .. } => url,
        }
    }
}

/// Seam between source adapters and the network: GET a URL, get JSON back.
#[async_trait]
pub trait JsonFetch: Send + Sync {
    async fn get_value(&self, url: &str) -> Result<JsonValue, FetchError>;
}

/// Fetches `url` and decodes the body into `T`.
pub async fn get_json<T, F>(http: &F, url: &str) -> Result<T, FetchError>
where
    T: DeserializeOwned,
    F: JsonFetch + ?Sized,
{
    let value = http.get_value(url).await?;
    serde_json::from_value(value).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug)]
pub struct HttpFetcher {
    source_id: String,
    client: reqwest::Client,
    limiter: Arc<TokenBucket>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpFetcher {
    pub fn new(
        source_id: impl Into<String>,
        config: HttpClientConfig,
        limiter: Arc<TokenBucket>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            source_id: source_id.into(),
            client,
            limiter,
            backoff: config.backoff,
            timeout: config.timeout,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn request_error(&self, url: &str, source: reqwest::Error) -> FetchError {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source,
            }
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id = %self.source_id, url);
        self.fetch_bytes_inner(url).instrument(span).await
    }

    async fn fetch_bytes_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            self.limiter.take().await;
            let result = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            let err = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| self.request_error(&final_url, source))?;
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body: body.to_vec(),
                        });
                    }
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    }
                }
                Err(source) => self.request_error(url, source),
            };

            if err.is_transient() && attempt < self.backoff.max_retries {
                debug!(attempt, error = %err, "transient failure; retrying");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

#[async_trait]
impl JsonFetch for HttpFetcher {
    async fn get_value(&self, url: &str) -> Result<JsonValue, FetchError> {
        let response = self.fetch_bytes(url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

/// In-memory [`JsonFetch`] serving canned JSON per URL; used by offline tests.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    routes: HashMap<String, JsonValue>,
    delays: HashMap<String, Duration>,
    failures: StdMutex<HashMap<String, usize>>,
    calls: StdMutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(mut self, url: impl Into<String>, body: JsonValue) -> Self {
        self.routes.insert(url.into(), body);
        self
    }

    /// The next `times` calls to `url` answer 503 before the route is served.
    pub fn with_failures(self, url: impl Into<String>, times: usize) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(url.into(), times);
        }
        self
    }

    pub fn with_delay(mut self, url: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(url.into(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl JsonFetch for FixtureFetcher {
    async fn get_value(&self, url: &str) -> Result<JsonValue, FetchError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        let should_fail = match self.failures.lock() {
            Ok(mut failures) => match failures.get_mut(url) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };
        if should_fail {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            });
        }
        self.routes
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_transient_failures() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.url(), "u");
    }

    #[tokio::test]
    async fn token_bucket_serializes_issuance_to_the_configured_rate() {
        let bucket = Arc::new(TokenBucket::per_second(20));
        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move { bucket.take().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // first token is immediate, the other three wait 50ms each
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn separate_buckets_do_not_interfere() {
        let slow = TokenBucket::per_second(1);
        let fast = TokenBucket::per_second(1000);
        slow.take().await;
        let started = Instant::now();
        for _ in 0..3 {
            fast.take().await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[derive(Debug, Deserialize)]
    struct Shape {
        id: u32,
    }

    #[tokio::test]
    async fn get_json_decodes_and_reports_shape_mismatch() {
        let http = FixtureFetcher::new()
            .with_json("https://api.test/ok", json!({"id": 7}))
            .with_json("https://api.test/bad", json!({"id": "seven"}));

        let ok: Shape = get_json(&http, "https://api.test/ok").await.unwrap();
        assert_eq!(ok.id, 7);

        let err = get_json::<Shape, _>(&http, "https://api.test/bad").await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));

        let missing = get_json::<Shape, _>(&http, "https://api.test/none").await.unwrap_err();
        assert!(matches!(missing, FetchError::HttpStatus { status: 404, .. }));
    }

    /// Minimal HTTP/1.1 server on a random local port. Each connection gets one
    /// canned response chosen by path and is closed afterwards.
    async fn serve_canned(flaky_hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let flaky_hits = Arc::clone(&flaky_hits);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    while read < buf.len() {
                        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match path.as_str() {
                        "/ok" => ("200 OK", r#"{"id": 7}"#),
                        "/garbage" => ("200 OK", "<html>maintenance</html>"),
                        "/slow" => {
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            ("200 OK", r#"{"id": 1}"#)
                        }
                        "/flaky" => {
                            if flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
                                ("503 Service Unavailable", "{}")
                            } else {
                                ("200 OK", r#"{"id": 2}"#)
                            }
                        }
                        _ => ("404 Not Found", "{}"),
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn fetcher(retries: usize, timeout: Duration, limiter: TokenBucket) -> HttpFetcher {
        let config = HttpClientConfig {
            timeout,
            user_agent: Some("polis-test".to_string()),
            backoff: BackoffPolicy {
                max_retries: retries,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
        };
        HttpFetcher::new("test", config, Arc::new(limiter)).unwrap()
    }

    #[tokio::test]
    async fn http_fetcher_maps_status_and_body_failures() {
        let base = serve_canned(Arc::new(AtomicUsize::new(0))).await;
        let http = fetcher(0, Duration::from_secs(5), TokenBucket::per_second(1000));

        let ok: Shape = get_json(&http, &format!("{base}/ok")).await.unwrap();
        assert_eq!(ok.id, 7);

        let missing = http.get_value(&format!("{base}/missing")).await.unwrap_err();
        assert!(matches!(missing, FetchError::HttpStatus { status: 404, .. }));
        assert!(!missing.is_transient());

        let garbage = http.get_value(&format!("{base}/garbage")).await.unwrap_err();
        assert!(matches!(garbage, FetchError::Decode { .. }));
        assert!(garbage.url().ends_with("/garbage"));
    }

    #[tokio::test]
    async fn http_fetcher_reports_slow_responses_as_transient_timeouts() {
        let base = serve_canned(Arc::new(AtomicUsize::new(0))).await;
        let http = fetcher(0, Duration::from_millis(200), TokenBucket::per_second(1000));

        let err = http.get_value(&format!("{base}/slow")).await.unwrap_err();
        match &err {
            FetchError::Timeout { after, .. } => assert_eq!(*after, Duration::from_millis(200)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn http_fetcher_retries_transient_status_when_configured() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve_canned(Arc::clone(&hits)).await;
        let http = fetcher(2, Duration::from_secs(5), TokenBucket::per_second(1000));

        let value = http.get_value(&format!("{base}/flaky")).await.unwrap();
        assert_eq!(value, json!({"id": 2}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn http_fetcher_without_retries_surfaces_the_first_failure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve_canned(Arc::clone(&hits)).await;
        let http = fetcher(0, Duration::from_secs(5), TokenBucket::per_second(1000));

        let err = http.get_value(&format!("{base}/flaky")).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_fetcher_requests_are_paced_by_the_bucket() {
        let base = serve_canned(Arc::new(AtomicUsize::new(0))).await;
        let http = Arc::new(fetcher(0, Duration::from_secs(5), TokenBucket::per_second(10)));
        let url = format!("{base}/ok");

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let http = Arc::clone(&http);
            let url = url.clone();
            handles.push(tokio::spawn(async move { http.get_value(&url).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // 4 requests at 10/s: the last one cannot leave before ~300ms
        assert!(started.elapsed() >= Duration::from_millis(280));
    }

    #[tokio::test]
    async fn fixture_failures_are_consumed_then_served() {
        let http = FixtureFetcher::new()
            .with_json("https://api.test/flaky", json!({"id": 1}))
            .with_failures("https://api.test/flaky", 1);
        let first = http.get_value("https://api.test/flaky").await.unwrap_err();
        assert!(first.is_transient());
        assert!(http.get_value("https://api.test/flaky").await.is_ok());
        assert_eq!(http.call_count("https://api.test/flaky"), 2);
    }
}
