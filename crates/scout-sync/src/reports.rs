//! Per-run scan reports and parquet snapshot export.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use scout_core::Listing;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::dedup::DedupCluster;
use crate::SourceReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub sources_total: usize,
    pub sources_failed: usize,
    pub collected: usize,
    pub repeated: usize,
    pub already_known: usize,
    pub emitted: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ListingsDelta<'a> {
    scan_run: &'a ScanRunRecord,
    sources: &'a [SourceReport],
    listings: &'a [Listing],
    clusters: &'a [DedupCluster],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `scan_brief.md` and `listings_delta.json` under
/// `<reports_root>/<run_id>/` and return that directory.
pub async fn write_run_reports(
    reports_root: &Path,
    run: &ScanRunRecord,
    sources: &[SourceReport],
    listings: &[Listing],
    clusters: &[DedupCluster],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(run.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("scan_brief.md"), render_brief(run, sources, clusters))
        .await
        .context("writing scan_brief.md")?;

    let delta = serde_json::to_vec_pretty(&ListingsDelta {
        scan_run: run,
        sources,
        listings,
        clusters,
    })
    .context("serializing listings delta")?;
    fs::write(run_dir.join("listings_delta.json"), delta)
        .await
        .context("writing listings_delta.json")?;

    Ok(run_dir)
}

fn render_brief(run: &ScanRunRecord, sources: &[SourceReport], clusters: &[DedupCluster]) -> String {
    let mut lines = vec![
        "# Coupon Scout Scan Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Sources: {} ({} failed)", run.sources_total, run.sources_failed),
        format!("- Listings collected: {}", run.collected),
        format!("- Repeated within run: {}", run.repeated),
        format!("- Already known: {}", run.already_known),
        format!("- Emitted after dedup: {}", run.emitted),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| source | status | anchors | emitted | rejected | failures |".to_string(),
        "|---|---|---|---|---|---|".to_string(),
    ];
    for source in sources {
        let status = match &source.error {
            Some(error) => format!("failed: {error}"),
            None => "ok".to_string(),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            source.source_id,
            status,
            source.stats.candidates,
            source.stats.emitted,
            source.stats.rejected,
            source.stats.failures()
        ));
    }

    if !clusters.is_empty() {
        lines.push(String::new());
        lines.push("## Merged Duplicates".to_string());
        lines.push(String::new());
        for cluster in clusters {
            lines.push(format!(
                "- kept `{}` from {} listings (best similarity {:.2})",
                cluster.survivor_url,
                cluster.members.len(),
                cluster.best_similarity
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Export `snapshots/listings.parquet` and `snapshots/sources.parquet` plus a
/// checksummed `manifest.json`; returns the manifest path.
pub async fn export_parquet_snapshot(
    run_dir: &Path,
    sources: &[SourceReport],
    listings: &[Listing],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    let sources_path = snapshot_dir.join("sources.parquet");
    write_listings_parquet(&listings_path, listings)?;
    write_sources_parquet(&sources_path, sources)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("listings", run_dir, &listings_path)?,
            manifest_entry("sources", run_dir, &sources_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown summary of the newest `runs` report directories.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("listings_delta.json").is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Coupon Scout Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let delta_path = dir.path().join("listings_delta.json");
        let brief_path = dir.path().join("scan_brief.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let run: ScanRunRecord = serde_json::from_value(
            delta
                .get("scan_run")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
        .with_context(|| format!("reading scan_run from {}", delta_path.display()))?;

        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- finished: {}", run.finished_at));
        lines.push(format!(
            "- sources: {} ({} failed)",
            run.sources_total, run.sources_failed
        ));
        lines.push(format!(
            "- listings: {} emitted of {} collected ({} already known)",
            run.emitted, run.collected, run.already_known
        ));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = parquet::arrow::ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Float64, false),
        ArrowField::new("student_count", DataType::UInt64, false),
        ArrowField::new("price", DataType::Utf8, false),
        ArrowField::new("discount", DataType::Utf8, false),
        ArrowField::new("expires_at", DataType::Utf8, false),
        ArrowField::new("quality_score", DataType::Float64, false),
        ArrowField::new("source_id", DataType::Utf8, false),
    ]));

    let strings = |f: fn(&Listing) -> String| {
        StringArray::from(listings.iter().map(f).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(|l| l.url.clone())),
            Arc::new(strings(|l| l.title.clone())),
            Arc::new(strings(|l| l.category.clone())),
            Arc::new(Float64Array::from(listings.iter().map(|l| l.rating).collect::<Vec<_>>())),
            Arc::new(UInt64Array::from(
                listings.iter().map(|l| l.student_count).collect::<Vec<_>>(),
            )),
            Arc::new(strings(|l| l.price.to_string())),
            Arc::new(strings(|l| l.discount.clone())),
            Arc::new(strings(|l| l.expires_at.to_rfc3339())),
            Arc::new(Float64Array::from(
                listings.iter().map(|l| l.quality_score).collect::<Vec<_>>(),
            )),
            Arc::new(strings(|l| l.source_id.clone())),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[SourceReport]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("listing_url", DataType::Utf8, false),
        ArrowField::new("error", DataType::Utf8, true),
        ArrowField::new("candidates", DataType::UInt64, false),
        ArrowField::new("emitted", DataType::UInt64, false),
        ArrowField::new("failures", DataType::UInt64, false),
    ]));
    let counts = |f: fn(&SourceReport) -> usize| {
        UInt64Array::from(sources.iter().map(|s| f(s) as u64).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                sources.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sources.iter().map(|s| s.listing_url.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sources.iter().map(|s| s.error.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(counts(|s| s.stats.candidates)),
            Arc::new(counts(|s| s.stats.emitted)),
            Arc::new(counts(|s| s.stats.failures())),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
