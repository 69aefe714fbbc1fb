//! Scan cycle orchestration: source registry, per-source fetching,
//! known-destination filtering, dedup, reports and the watch loop.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scout_adapters::{AnchorStats, FailureKind, ListingFetcher, PageFetcher, ResolverPolicy, SourceTarget};
use scout_core::{KnownDestinations, Listing};
use scout_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, KnownDestinationStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub mod dedup;
pub mod reports;

pub use dedup::{DedupCluster, DedupConfig, DedupHook, DedupOutcome, SimilarityEngine};
pub use reports::{report_recent_markdown, ParquetManifest, ScanRunRecord};

pub const CRATE_NAME: &str = "scout-sync";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid source registry: {0}")]
    Registry(#[from] serde_yaml::Error),
    #[error("source {source_id} has an unusable listing url {url}")]
    InvalidListingUrl { source_id: String, url: String },
    #[error("source id {0} is declared more than once")]
    DuplicateSource(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub listing_url: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, ScanError> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Source ids must be unique; enabled sources need an http(s) listing url.
    pub fn validate(&self) -> Result<(), ScanError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ScanError::DuplicateSource(source.source_id.clone()));
            }
            if !source.enabled {
                continue;
            }
            let usable = Url::parse(&source.listing_url)
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !usable {
                return Err(ScanError::InvalidListingUrl {
                    source_id: source.source_id.clone(),
                    url: source.listing_url.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn enabled_targets(&self) -> Vec<SourceTarget> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| SourceTarget {
                source_id: s.source_id.clone(),
                listing_url: s.listing_url.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub known_destinations_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub rate_limit_secs: u64,
    pub interval_minutes: u64,
    pub similarity_threshold: f64,
    pub max_anchors: usize,
    pub log_level: String,
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let workspace_root = lookup("SCOUT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            reports_dir: lookup("SCOUT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            known_destinations_path: lookup("SCOUT_KNOWN_DESTINATIONS")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("state").join("known_destinations.json")),
            user_agent: lookup("SCOUT_USER_AGENT").unwrap_or_else(|| "coupon-scout/0.1".to_string()),
            http_timeout_secs: parsed(lookup("SCOUT_HTTP_TIMEOUT_SECS"), 30),
            http_max_retries: parsed(lookup("SCOUT_HTTP_MAX_RETRIES"), 0),
            rate_limit_secs: parsed(lookup("SCOUT_RATE_LIMIT_SECS"), 2),
            interval_minutes: parsed(lookup("SCOUT_INTERVAL_MINUTES"), 30),
            similarity_threshold: parsed(
                lookup("SCOUT_SIMILARITY_THRESHOLD"),
                dedup::DEFAULT_SIMILARITY_THRESHOLD,
            ),
            max_anchors: parsed(
                lookup("SCOUT_MAX_ANCHORS"),
                scout_adapters::fetcher::DEFAULT_MAX_ANCHORS,
            ),
            log_level: lookup("SCOUT_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: Duration::from_secs(self.rate_limit_secs),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Outcome of one source within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub listing_url: String,
    pub stats: AnchorStats,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub sources: Vec<SourceReport>,
    pub collected: usize,
    /// Same canonical URL seen earlier in this cycle.
    pub repeated: usize,
    pub already_known: usize,
    pub dedup: DedupOutcome,
}

impl CycleOutcome {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.failure.is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_total: usize,
    pub sources_failed: usize,
    pub collected: usize,
    pub emitted: usize,
    pub merged: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct ScanPipeline {
    config: ScanConfig,
    fetcher: Box<dyn PageFetcher>,
    listings: ListingFetcher,
    dedup: Box<dyn DedupHook>,
}

impl ScanPipeline {
    pub fn new(config: ScanConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let listings = ListingFetcher::new(ResolverPolicy::default(), config.max_anchors)
            .context("building listing fetcher")?;
        let dedup = SimilarityEngine::new(DedupConfig {
            threshold: config.similarity_threshold,
        });
        Ok(Self {
            config,
            fetcher: Box::new(http),
            listings,
            dedup: Box::new(dedup),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn PageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_dedup(mut self, dedup: Box<dyn DedupHook>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan every target in order, drop repeats and already-known URLs, then
    /// dedup. Source failures are recorded and never abort the cycle.
    pub async fn scan_cycle(&self, targets: &[SourceTarget], known: &dyn KnownDestinations) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let mut collected: Vec<Listing> = Vec::new();

        for target in targets {
            match self
                .listings
                .fetch_source(self.fetcher.as_ref(), target, Utc::now())
                .await
            {
                Ok(scan) => {
                    outcome.sources.push(SourceReport {
                        source_id: scan.source_id,
                        listing_url: scan.listing_url,
                        stats: scan.stats,
                        failure: None,
                        error: None,
                    });
                    collected.extend(scan.listings);
                }
                Err(err) => {
                    warn!(source_id = %target.source_id, url = %target.listing_url, error = %err, "source scan failed");
                    outcome.sources.push(SourceReport {
                        source_id: target.source_id.clone(),
                        listing_url: target.listing_url.clone(),
                        stats: AnchorStats::default(),
                        failure: Some(err.kind()),
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        outcome.collected = collected.len();
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(collected.len());
        for listing in collected {
            if !seen.insert(listing.url.clone()) {
                outcome.repeated += 1;
            } else if known.exists(&listing.url) {
                outcome.already_known += 1;
            } else {
                fresh.push(listing);
            }
        }

        outcome.dedup = self.dedup.apply(fresh);
        info!(
            collected = outcome.collected,
            repeated = outcome.repeated,
            already_known = outcome.already_known,
            emitted = outcome.dedup.listings.len(),
            merged = outcome.dedup.merged(),
            "scan cycle complete"
        );
        outcome
    }

    /// One full cycle: registry, ledger, scan, ledger update, reports.
    pub async fn run_once(&self) -> Result<ScanRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let targets = registry.enabled_targets();
        let mut ledger = KnownDestinationStore::load(&self.config.known_destinations_path).await?;

        let outcome = self.scan_cycle(&targets, &ledger).await;

        for listing in &outcome.dedup.listings {
            ledger.record(&listing.url);
        }
        ledger.persist().await?;

        let finished_at = Utc::now();
        let run = ScanRunRecord {
            run_id,
            started_at,
            finished_at,
            status: "completed".to_string(),
            sources_total: outcome.sources.len(),
            sources_failed: outcome.failed_sources(),
            collected: outcome.collected,
            repeated: outcome.repeated,
            already_known: outcome.already_known,
            emitted: outcome.dedup.listings.len(),
        };
        let run_dir = reports::write_run_reports(
            &self.config.reports_dir,
            &run,
            &outcome.sources,
            &outcome.dedup.listings,
            &outcome.dedup.clusters,
        )
        .await?;
        let manifest_path =
            reports::export_parquet_snapshot(&run_dir, &outcome.sources, &outcome.dedup.listings).await?;

        Ok(ScanRunSummary {
            run_id,
            started_at,
            finished_at,
            sources_total: run.sources_total,
            sources_failed: run.sources_failed,
            collected: run.collected,
            emitted: run.emitted,
            merged: outcome.dedup.merged(),
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }
}

pub async fn run_scan_once_from_env() -> Result<ScanRunSummary> {
    ScanPipeline::new(ScanConfig::from_env())?.run_once().await
}

/// Run a cycle now and then once per `interval` until `shutdown` flips to
/// true. A running cycle is never interrupted. Returns the number of cycles.
pub async fn run_watch(
    pipeline: &ScanPipeline,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match pipeline.run_once().await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                emitted = summary.emitted,
                sources_failed = summary.sources_failed,
                "watch cycle finished"
            ),
            Err(err) => warn!(error = ?err, "watch cycle failed"),
        }
        cycles += 1;

        if *shutdown.borrow() {
            break;
        }
    }
    info!(cycles, "watch loop stopped");
    cycles
}

/// Receiver that flips to true on the first Ctrl-C or SIGTERM.
pub fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let mut terminate = terminate_listener();
    tokio::spawn(async move {
        let ctrl_c_failure = tokio::select! {
            res = tokio::signal::ctrl_c() => res.err(),
            _ = wait_for_terminate(&mut terminate) => None,
        };
        if let Some(err) = ctrl_c_failure {
            warn!(error = %err, "failed to listen for ctrl-c");
            wait_for_terminate(&mut terminate).await;
        }
        info!("shutdown requested; finishing current cycle");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
type TerminateListener = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type TerminateListener = Option<()>;

/// Registered eagerly so a SIGTERM sent right after startup is not lost.
#[cfg(unix)]
fn terminate_listener() -> TerminateListener {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler");
            None
        }
    }
}

#[cfg(not(unix))]
fn terminate_listener() -> TerminateListener {
    None
}

#[cfg(unix)]
async fn wait_for_terminate(listener: &mut TerminateListener) {
    match listener {
        Some(sigterm) => {
            sigterm.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_terminate(_listener: &mut TerminateListener) {
    std::future::pending::<()>().await
}
