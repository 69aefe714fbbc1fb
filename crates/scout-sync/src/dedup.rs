//! Pairwise listing similarity and greedy near-duplicate collapsing.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use scout_core::Listing;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Generic course-marketing words ignored when comparing texts.
const FILLER_WORDS: &[&str] = &[
    "complete",
    "comprehensive",
    "ultimate",
    "full",
    "total",
    "entire",
    "master",
    "mastering",
    "learn",
    "learning",
    "course",
    "tutorial",
    "guide",
    "introduction",
    "intro",
    "advanced",
    "beginner",
    "basic",
    "professional",
    "pro",
    "expert",
    "bootcamp",
    "training",
];

const MIN_WORD_CHARS: usize = 3;

fn filler_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"\b(?:{})\b", FILLER_WORDS.join("|"))).unwrap())
}

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b20\d{2}\b").unwrap())
}

fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}\s]").unwrap())
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Composite similarity at or above which two listings are duplicates.
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// One group of listings collapsed into a single survivor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupCluster {
    pub survivor_url: String,
    /// Every member URL in input order, survivor included.
    pub members: Vec<String>,
    pub best_similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupOutcome {
    pub listings: Vec<Listing>,
    pub clusters: Vec<DedupCluster>,
}

impl DedupOutcome {
    pub fn merged(&self) -> usize {
        self.clusters.iter().map(|c| c.members.len() - 1).sum()
    }
}

pub trait DedupHook: Send + Sync {
    fn apply(&self, listings: Vec<Listing>) -> DedupOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityEngine {
    threshold: f64,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

impl SimilarityEngine {
    /// Thresholds outside `(0, 1]` fall back to the default.
    pub fn new(config: DedupConfig) -> Self {
        let threshold = if config.threshold > 0.0 && config.threshold <= 1.0 {
            config.threshold
        } else {
            DEFAULT_SIMILARITY_THRESHOLD
        };
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn normalize_text(text: &str) -> String {
        let lower = text.to_lowercase();
        let stripped = filler_regex().replace_all(&lower, " ");
        let stripped = year_regex().replace_all(&stripped, " ");
        let stripped = symbol_regex().replace_all(&stripped, " ");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Jaccard similarity over normalized words of three or more characters.
    pub fn text_similarity(a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let norm_a = Self::normalize_text(a);
        let norm_b = Self::normalize_text(b);
        if norm_a == norm_b {
            return 1.0;
        }

        let words = |text: &str| -> HashSet<String> {
            text.split_whitespace()
                .filter(|w| w.chars().count() >= MIN_WORD_CHARS)
                .map(str::to_string)
                .collect()
        };
        let set_a = words(&norm_a);
        let set_b = words(&norm_b);
        let intersection = set_a.intersection(&set_b).count();
        let union = set_a.len() + set_b.len() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f64 / union as f64
    }

    pub fn similarity(&self, a: &Listing, b: &Listing) -> f64 {
        let mut score = 0.6 * Self::text_similarity(&a.title, &b.title)
            + 0.2 * Self::text_similarity(&a.description, &b.description);
        if a.category.to_lowercase() == b.category.to_lowercase() {
            score += 0.2;
        }
        if (a.rating - b.rating).abs() <= 0.5 {
            score += 0.05;
        }
        if a.student_count > 0 && b.student_count > 0 {
            let low = a.student_count.min(b.student_count) as f64;
            let high = a.student_count.max(b.student_count) as f64;
            if low / high >= 0.8 {
                score += 0.05;
            }
        }
        score.min(1.0)
    }

    pub fn is_duplicate(&self, a: &Listing, b: &Listing) -> bool {
        self.similarity(a, b) >= self.threshold
    }

    /// Quality score, then rating, then student count, then the later
    /// `posted_at`. The incumbent keeps its place on a full tie.
    pub fn best_of<'a>(incumbent: &'a Listing, challenger: &'a Listing) -> &'a Listing {
        if rank(challenger, incumbent) == Ordering::Greater {
            challenger
        } else {
            incumbent
        }
    }

    pub fn deduplicate(&self, listings: Vec<Listing>) -> Vec<Listing> {
        self.deduplicate_with_report(listings).listings
    }

    /// Greedy single pass: each unclaimed listing opens a cluster and every
    /// later unclaimed listing similar to the cluster's *current* best joins
    /// it, possibly replacing the best. Order dependent by construction.
    pub fn deduplicate_with_report(&self, listings: Vec<Listing>) -> DedupOutcome {
        let mut slots: Vec<Option<Listing>> = listings.into_iter().map(Some).collect();
        let mut outcome = DedupOutcome::default();

        for i in 0..slots.len() {
            let Some(mut best) = slots[i].take() else {
                continue;
            };
            let mut members = vec![best.url.clone()];
            let mut best_similarity = 0.0f64;

            for slot in slots.iter_mut().skip(i + 1) {
                let score = match slot.as_ref() {
                    Some(candidate) => self.similarity(&best, candidate),
                    None => continue,
                };
                if score < self.threshold {
                    continue;
                }
                let Some(candidate) = slot.take() else {
                    continue;
                };
                members.push(candidate.url.clone());
                best_similarity = best_similarity.max(score);
                if rank(&candidate, &best) == Ordering::Greater {
                    best = candidate;
                }
            }

            if members.len() > 1 {
                outcome.clusters.push(DedupCluster {
                    survivor_url: best.url.clone(),
                    members,
                    best_similarity,
                });
            }
            outcome.listings.push(best);
        }
        outcome
    }
}

impl DedupHook for SimilarityEngine {
    fn apply(&self, listings: Vec<Listing>) -> DedupOutcome {
        self.deduplicate_with_report(listings)
    }
}

fn rank(a: &Listing, b: &Listing) -> Ordering {
    a.quality_score
        .total_cmp(&b.quality_score)
        .then_with(|| a.rating.total_cmp(&b.rating))
        .then_with(|| a.student_count.cmp(&b.student_count))
        .then_with(|| a.posted_at.cmp(&b.posted_at))
}
