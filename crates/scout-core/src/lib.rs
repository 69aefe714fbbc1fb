//! Core domain model for course coupon listings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod quality;
pub mod validation;

pub use quality::{quality_score, quality_score_for_year};
pub use validation::{sanitize, validate_url, UrlPolicy, ValidationError};

pub const CRATE_NAME: &str = "scout-core";

/// Category used when no extraction strategy produced one.
pub const DEFAULT_CATEGORY: &str = "General";

/// Maximum title length (in characters) kept on a listing.
pub const MAX_TITLE_CHARS: usize = 200;

/// Titles shorter than this after sanitizing are not listings.
pub const MIN_TITLE_CHARS: usize = 10;

/// Price label attached to a listing.
///
/// Serialized as its display string ("Free", "Free (Coupon)", "$12.99", "Unknown").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Price {
    Free,
    FreeCoupon,
    Amount(String),
    Unknown,
}

impl Price {
    pub fn is_free(&self) -> bool {
        matches!(self, Price::Free | Price::FreeCoupon)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Free => f.write_str("Free"),
            Price::FreeCoupon => f.write_str("Free (Coupon)"),
            Price::Amount(amount) => f.write_str(amount),
            Price::Unknown => f.write_str("Unknown"),
        }
    }
}

impl From<String> for Price {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Free" => Price::Free,
            "Free (Coupon)" => Price::FreeCoupon,
            "Unknown" | "" => Price::Unknown,
            _ => Price::Amount(value),
        }
    }
}

impl From<Price> for String {
    fn from(value: Price) -> Self {
        value.to_string()
    }
}

/// One extracted course offer.
///
/// Built once per anchor during a scan and never mutated afterwards; dedup
/// only chooses between listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub rating: f64,
    pub student_count: u64,
    pub price: Price,
    pub discount: String,
    pub expires_at: DateTime<Utc>,
    pub quality_score: f64,
    pub source_id: String,
    pub source_url: String,
    pub posted_at: DateTime<Utc>,
}

/// Lookup of canonical URLs already emitted by earlier scan cycles.
pub trait KnownDestinations: Send + Sync {
    fn exists(&self, url: &str) -> bool;
}

impl KnownDestinations for std::collections::HashSet<String> {
    fn exists(&self, url: &str) -> bool {
        self.contains(url)
    }
}
