//! One source page in, scored listings out.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use scout_core::{quality_score_for_year, Listing};
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extract::{AnchorSnapshot, FieldExtractor};
use crate::resolve::{LinkResolver, Resolution, ResolveError, ResolverPolicy};
use crate::{fetch_document, selector, AdapterError, FailureKind, PageFetcher};

/// Hard cap on anchors processed per page.
pub const DEFAULT_MAX_ANCHORS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub source_id: String,
    pub listing_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorStats {
    /// Anchors matching the link pattern, before the cap.
    pub candidates: usize,
    pub processed: usize,
    pub emitted: usize,
    /// Titles too short to be a listing.
    pub rejected: usize,
    pub resolution_failures: usize,
    pub validation_failures: usize,
    pub fetch_failures: usize,
    pub parse_failures: usize,
}

impl AnchorStats {
    fn record_failure(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Fetch => self.fetch_failures += 1,
            FailureKind::Parse => self.parse_failures += 1,
            FailureKind::Resolution => self.resolution_failures += 1,
            FailureKind::Validation => self.validation_failures += 1,
        }
    }

    pub fn failures(&self) -> usize {
        self.resolution_failures + self.validation_failures + self.fetch_failures + self.parse_failures
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceScan {
    pub source_id: String,
    pub listing_url: String,
    pub listings: Vec<Listing>,
    pub stats: AnchorStats,
}

#[derive(Debug, Clone)]
pub struct ListingFetcher {
    resolver: LinkResolver,
    extractor: FieldExtractor,
    max_anchors: usize,
}

impl ListingFetcher {
    pub fn new(policy: ResolverPolicy, max_anchors: usize) -> Result<Self, AdapterError> {
        let extractor = FieldExtractor::new(&policy.destination_marker)?;
        Ok(Self {
            resolver: LinkResolver::new(policy),
            extractor,
            max_anchors,
        })
    }

    pub fn resolver(&self) -> &LinkResolver {
        &self.resolver
    }

    /// Snapshot every candidate anchor (target-domain or coupon-page link),
    /// capped at `max_anchors`. Returns the uncapped candidate count too.
    pub fn collect_anchors(&self, html: &str) -> Result<(Vec<AnchorSnapshot>, usize), AdapterError> {
        let policy = self.resolver.policy();
        let css = format!(
            "a[href*='{}'], a[href*='{}']",
            policy.target_domain, policy.intermediate_marker
        );
        let anchors = selector(&css)?;
        let document = Html::parse_document(html);

        let mut candidates = 0usize;
        let mut snapshots = Vec::new();
        for anchor in document.select(&anchors) {
            candidates += 1;
            if snapshots.len() < self.max_anchors {
                snapshots.push(self.extractor.snapshot(anchor));
            }
        }
        Ok((snapshots, candidates))
    }

    /// Fetch one source page and turn its anchors into listings. A failed
    /// page fetch aborts the source; per-anchor failures are counted and
    /// skipped.
    pub async fn fetch_source(
        &self,
        fetcher: &dyn PageFetcher,
        target: &SourceTarget,
        now: DateTime<Utc>,
    ) -> Result<SourceScan, AdapterError> {
        let html = fetch_document(fetcher, &target.listing_url).await?;
        let (snapshots, candidates) = self.collect_anchors(&html)?;
        if candidates > snapshots.len() {
            warn!(
                source_id = %target.source_id,
                candidates,
                cap = self.max_anchors,
                "anchor cap reached"
            );
        }

        let mut stats = AnchorStats {
            candidates,
            ..AnchorStats::default()
        };
        let mut listings = Vec::new();
        let mut resolved: HashMap<String, Result<Resolution, FailureKind>> = HashMap::new();

        for snapshot in &snapshots {
            stats.processed += 1;
            let resolution = match resolved.get(&snapshot.href) {
                Some(cached) => cached.clone(),
                None => {
                    let outcome = self
                        .resolver
                        .resolve(fetcher, &snapshot.href, &target.listing_url)
                        .await
                        .map_err(|err| log_resolve_failure(&target.source_id, &snapshot.href, &err));
                    resolved.insert(snapshot.href.clone(), outcome.clone());
                    outcome
                }
            };
            let resolution = match resolution {
                Ok(resolution) => resolution,
                Err(kind) => {
                    stats.record_failure(kind);
                    continue;
                }
            };

            let fields = match self.extractor.extract(snapshot, &resolution, now) {
                Ok(fields) => fields,
                Err(rejection) => {
                    debug!(source_id = %target.source_id, href = %snapshot.href, %rejection, "anchor rejected");
                    stats.rejected += 1;
                    continue;
                }
            };

            let quality_score = quality_score_for_year(
                fields.rating,
                fields.student_count,
                &fields.title,
                &fields.description,
                now.year(),
            );
            listings.push(Listing {
                url: resolution.url,
                title: fields.title,
                description: fields.description,
                category: fields.category,
                rating: fields.rating,
                student_count: fields.student_count,
                price: fields.price,
                discount: fields.discount,
                expires_at: fields.expires_at,
                quality_score,
                source_id: target.source_id.clone(),
                source_url: target.listing_url.clone(),
                posted_at: now,
            });
            stats.emitted += 1;
        }

        info!(
            source_id = %target.source_id,
            candidates = stats.candidates,
            emitted = stats.emitted,
            failures = stats.failures(),
            rejected = stats.rejected,
            "source scanned"
        );
        Ok(SourceScan {
            source_id: target.source_id.clone(),
            listing_url: target.listing_url.clone(),
            listings,
            stats,
        })
    }
}

fn log_resolve_failure(source_id: &str, href: &str, err: &ResolveError) -> FailureKind {
    let kind = err.kind();
    match kind {
        FailureKind::Validation => debug!(source_id, href, error = %err, "anchor failed validation"),
        _ => warn!(source_id, href, error = %err, ?kind, "link resolution failed"),
    }
    kind
}
