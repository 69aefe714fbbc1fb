//! Rate-limited HTTP fetching + the on-disk ledger of known course destinations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use scout_core::KnownDestinations;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-storage";

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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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
    /// Fixed pause before every request, successful or not.
    pub rate_limit: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            rate_limit: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher. Every call sleeps for the configured rate limit
/// before touching the network.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    rate_limit: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            rate_limit: config.rate_limit,
            backoff: config.backoff,
        })
    }

    pub fn rate_limit(&self) -> Duration {
        self.rate_limit
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        tokio::time::sleep(self.rate_limit).await;

        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated_at: DateTime<Utc>,
    urls: Vec<String>,
}

/// Canonical URLs emitted by earlier scan cycles, persisted as JSON.
#[derive(Debug, Clone)]
pub struct KnownDestinationStore {
    path: PathBuf,
    urls: BTreeSet<String>,
    dirty: bool,
}

impl KnownDestinationStore {
    /// Load the ledger at `path`; a missing file is an empty ledger.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let urls = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking ledger path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let file: LedgerFile =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            file.urls.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path,
            urls,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Returns `true` when the URL was not already known.
    pub fn record(&mut self, url: &str) -> bool {
        let inserted = self.urls.insert(url.to_string());
        self.dirty |= inserted;
        inserted
    }

    /// Write the ledger through a temp file + rename so readers never see a
    /// half-written file. No-op when nothing changed since the last load/persist.
    pub async fn persist(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating ledger directory {}", parent.display()))?;

        let file = LedgerFile {
            version: 1,
            updated_at: Utc::now(),
            urls: self.urls.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing known destinations")?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut handle = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp ledger file {}", temp_path.display()))?;
        handle
            .write_all(&bytes)
            .await
            .with_context(|| format!("writing temp ledger file {}", temp_path.display()))?;
        handle
            .flush()
            .await
            .with_context(|| format!("flushing temp ledger file {}", temp_path.display()))?;
        drop(handle);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp ledger {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        self.dirty = false;
        Ok(())
    }
}

impl KnownDestinations for KnownDestinationStore {
    fn exists(&self, url: &str) -> bool {
        self.urls.contains(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

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
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn fetcher_builds_with_default_config() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        assert_eq!(fetcher.rate_limit(), Duration::from_secs(2));
    }

    fn paced_config(rate_limit: Duration) -> HttpClientConfig {
        HttpClientConfig {
            rate_limit,
            ..HttpClientConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_request_waits_for_the_rate_limit_even_when_it_fails() {
        let fetcher = HttpFetcher::new(paced_config(Duration::from_secs(2))).expect("client");
        let started = tokio::time::Instant::now();

        for url in ["not a url", "ftp://coupons.example/feed", "::"] {
            let err = fetcher.fetch_bytes(url).await.unwrap_err();
            assert!(matches!(err, FetchError::Request(_)));
        }

        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_hits_the_request_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/feed", listener.local_addr().expect("addr"));
        let config = paced_config(Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(30));
        let fetcher = HttpFetcher::new(config).expect("client");
        let started = tokio::time::Instant::now();

        let err = fetcher.fetch_bytes(&url).await.unwrap_err();

        match err {
            FetchError::Request(inner) => assert!(inner.is_timeout()),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(32));
        drop(listener);
    }

    #[tokio::test]
    async fn missing_ledger_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = KnownDestinationStore::load(dir.path().join("state/known.json"))
            .await
            .expect("load");
        assert!(store.is_empty());
        assert!(!store.exists("https://www.udemy.com/course/rust/"));
    }

    #[tokio::test]
    async fn recorded_urls_survive_persist_and_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state/known.json");

        let mut store = KnownDestinationStore::load(&path).await.expect("load");
        assert!(store.record("https://www.udemy.com/course/rust/"));
        assert!(!store.record("https://www.udemy.com/course/rust/"));
        store.persist().await.expect("persist");
        assert!(path.exists());

        let reloaded = KnownDestinationStore::load(&path).await.expect("reload");
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.exists("https://www.udemy.com/course/rust/"));

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
