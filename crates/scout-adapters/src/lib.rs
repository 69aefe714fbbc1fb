//! Coupon-site adapters: page fetching seam, link resolution, field extraction
//! and per-source listing assembly.

use async_trait::async_trait;
use scout_storage::{FetchError, HttpFetcher};
use scraper::Selector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod extract;
pub mod fetcher;
pub mod resolve;

pub use extract::{parse_coupon_date, AnchorSnapshot, ExtractRejection, ExtractedFields, FieldExtractor};
pub use fetcher::{AnchorStats, ListingFetcher, SourceScan, SourceTarget};
pub use resolve::{LinkOrigin, LinkResolver, Resolution, ResolveError, ResolverPolicy};

pub const CRATE_NAME: &str = "scout-adapters";

/// Coarse failure buckets reported per source and per anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureKind {
    Fetch,
    Parse,
    Resolution,
    Validation,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("unparseable markup at {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Fetch { .. } => FailureKind::Fetch,
            AdapterError::Parse { .. } | AdapterError::Message(_) => FailureKind::Parse,
        }
    }
}

/// Source of raw page bodies. The network implementation is [`HttpFetcher`];
/// tests substitute canned pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetch_bytes(url).await?.body)
    }
}

/// Fetch a page and check it decodes to something that looks like markup.
pub async fn fetch_document(fetcher: &dyn PageFetcher, url: &str) -> Result<String, AdapterError> {
    let body = fetcher
        .fetch_page(url)
        .await
        .map_err(|source| AdapterError::Fetch {
            url: url.to_string(),
            source,
        })?;
    let text = String::from_utf8(body).map_err(|e| AdapterError::Parse {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !text.contains('<') {
        return Err(AdapterError::Parse {
            url: url.to_string(),
            reason: "response contains no markup".to_string(),
        });
    }
    Ok(text)
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}
