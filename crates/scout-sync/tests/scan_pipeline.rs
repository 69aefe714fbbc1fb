use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use scout_adapters::{FailureKind, PageFetcher, SourceTarget};
use scout_core::Listing;
use scout_storage::FetchError;
use scout_sync::{
    report_recent_markdown, run_watch, DedupCluster, DedupHook, DedupOutcome, ParquetManifest, ScanConfig,
    ScanPipeline, CRATE_NAME,
};
use tempfile::tempdir;
use tokio::sync::watch;

const SITE: &str = "https://coupons.example";

const SOURCES: &str = r#"
sources:
  - source_id: coupons-example
    display_name: Coupons Example
    enabled: true
    listing_url: https://coupons.example/latest
  - source_id: dead-site
    display_name: Dead Site
    enabled: true
    listing_url: https://dead.example/feed
  - source_id: paused
    display_name: Paused
    enabled: false
    listing_url: https://paused.example/
"#;

/// Serves the coupon-site fixtures; optionally flips a shutdown flag on the
/// first request.
struct FixtureSite {
    routes: HashMap<String, PathBuf>,
    stop: Option<watch::Sender<bool>>,
    hits: Mutex<usize>,
}

impl FixtureSite {
    fn new() -> Self {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/coupon-site");
        let routes = [
            ("/latest", "listing.html"),
            ("/coupon/python-bootcamp-2025", "coupon-python.html"),
            ("/claim/abc", "claim-python.html"),
            ("/coupon/broken-offer", "coupon-broken.html"),
        ]
        .into_iter()
        .map(|(path, file)| (format!("{SITE}{path}"), root.join(file)))
        .collect();
        Self {
            routes,
            stop: None,
            hits: Mutex::new(0),
        }
    }

    fn stopping(stop: watch::Sender<bool>) -> Self {
        Self {
            stop: Some(stop),
            ..Self::new()
        }
    }
}

#[async_trait]
impl PageFetcher for FixtureSite {
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        *self.hits.lock().unwrap() += 1;
        if let Some(stop) = &self.stop {
            let _ = stop.send(true);
        }
        match self.routes.get(url) {
            Some(path) => Ok(std::fs::read(path).expect("fixture readable")),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

fn workspace(root: &Path) -> ScanConfig {
    std::fs::write(root.join("sources.yaml"), SOURCES).unwrap();
    let root = root.display().to_string();
    ScanConfig::from_lookup(|key| match key {
        "SCOUT_WORKSPACE_ROOT" => Some(root.clone()),
        "SCOUT_RATE_LIMIT_SECS" => Some("0".to_string()),
        _ => None,
    })
}

#[tokio::test]
async fn scan_runs_write_reports_and_skip_known_destinations() {
    assert_eq!(CRATE_NAME, "scout-sync");
    let dir = tempdir().unwrap();
    let config = workspace(dir.path());
    let pipeline = ScanPipeline::new(config.clone())
        .unwrap()
        .with_fetcher(Box::new(FixtureSite::new()));

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.sources_total, 2);
    assert_eq!(first.sources_failed, 1);
    assert_eq!(first.collected, 3);
    assert_eq!(first.emitted, 3);
    assert_eq!(first.merged, 0);
    assert!(config.known_destinations_path.is_file());

    let run_dir = PathBuf::from(&first.reports_dir);
    let brief = std::fs::read_to_string(run_dir.join("scan_brief.md")).unwrap();
    assert!(brief.contains("| coupons-example | ok | 5 | 3 | 1 | 1 |"));
    assert!(brief.contains("dead-site | failed:"));

    let delta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("listings_delta.json")).unwrap()).unwrap();
    assert_eq!(delta["listings"].as_array().unwrap().len(), 3);
    assert_eq!(delta["sources"][1]["failure"], serde_json::json!(FailureKind::Fetch));

    let manifest: ParquetManifest =
        serde_json::from_str(&std::fs::read_to_string(&first.parquet_manifest).unwrap()).unwrap();
    assert_eq!(manifest.files.len(), 2);
    for file in &manifest.files {
        assert_eq!(file.sha256.len(), 64);
        assert!(run_dir.join(&file.path).is_file());
    }

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.collected, 3);
    assert_eq!(second.emitted, 0);

    let recent = report_recent_markdown(5, &config.reports_dir).unwrap();
    assert!(recent.contains(&first.run_id.to_string()));
    assert!(recent.contains(&second.run_id.to_string()));
    assert!(recent.contains("0 emitted of 3 collected (3 already known)"));
}

#[tokio::test]
async fn watch_loop_finishes_the_running_cycle_before_stopping() {
    let dir = tempdir().unwrap();
    let config = workspace(dir.path());
    let (tx, rx) = watch::channel(false);
    let pipeline = ScanPipeline::new(config.clone())
        .unwrap()
        .with_fetcher(Box::new(FixtureSite::stopping(tx)));

    let cycles = run_watch(&pipeline, Duration::from_secs(3600), rx).await;

    assert_eq!(cycles, 1);
    // the cycle kept going after the flag flipped on its first request
    let runs = std::fs::read_dir(&config.reports_dir).unwrap().count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn watch_loop_does_nothing_when_already_stopped() {
    let dir = tempdir().unwrap();
    let config = workspace(dir.path());
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let pipeline = ScanPipeline::new(config.clone())
        .unwrap()
        .with_fetcher(Box::new(FixtureSite::new()));

    let cycles = run_watch(&pipeline, Duration::from_secs(3600), rx).await;

    assert_eq!(cycles, 0);
    assert!(!config.reports_dir.exists());
    drop(tx);
}

/// Collapses everything into the first listing.
struct KeepFirst;

impl DedupHook for KeepFirst {
    fn apply(&self, mut listings: Vec<Listing>) -> DedupOutcome {
        let members: Vec<String> = listings.iter().map(|l| l.url.clone()).collect();
        listings.truncate(1);
        let clusters = match listings.first() {
            Some(first) if members.len() > 1 => vec![DedupCluster {
                survivor_url: first.url.clone(),
                members,
                best_similarity: 1.0,
            }],
            _ => Vec::new(),
        };
        DedupOutcome { listings, clusters }
    }
}

#[tokio::test]
async fn custom_dedup_hook_sees_only_unknown_listings() {
    let dir = tempdir().unwrap();
    let pipeline = ScanPipeline::new(workspace(dir.path()))
        .unwrap()
        .with_fetcher(Box::new(FixtureSite::new()))
        .with_dedup(Box::new(KeepFirst));
    let targets = vec![SourceTarget {
        source_id: "coupons-example".to_string(),
        listing_url: format!("{SITE}/latest"),
    }];
    let known: HashSet<String> =
        HashSet::from(["https://www.udemy.com/course/docker-kubernetes-devops/?couponCode=NOV2030".to_string()]);

    let outcome = pipeline.scan_cycle(&targets, &known).await;

    assert_eq!(outcome.collected, 3);
    assert_eq!(outcome.already_known, 1);
    assert_eq!(outcome.failed_sources(), 0);
    assert_eq!(outcome.dedup.listings.len(), 1);
    assert_eq!(
        outcome.dedup.listings[0].url,
        "https://www.udemy.com/course/complete-python-bootcamp/?couponCode=22JULY2025"
    );
    assert_eq!(outcome.dedup.merged(), 1);
    assert_eq!(outcome.dedup.clusters[0].members.len(), 2);
}
