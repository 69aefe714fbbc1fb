//! Text sanitizing and URL allowlist checks applied to scraped input.

use thiserror::Error;
use url::Url;

/// Default cap for sanitized free text.
pub const MAX_TEXT_CHARS: usize = 1000;

/// URLs longer than this (in bytes) are rejected outright.
pub const MAX_URL_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("url exceeds 2048 bytes")]
    TooLong,
    #[error("malformed url {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("unsupported url scheme {0}")]
    Scheme(String),
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
}

/// Hosts a scraped link may point at: the course platform plus the
/// affiliate-tracking domains that wrap it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPolicy {
    pub allowed_domains: Vec<String>,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allowed_domains: vec![
                "udemy.com".to_string(),
                "linksynergy.com".to_string(),
            ],
        }
    }
}

impl UrlPolicy {
    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Replace newlines/tabs with spaces, drop other control characters, collapse
/// whitespace runs, trim, and cap at `max_chars` characters.
pub fn sanitize(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    match out.char_indices().nth(max_chars) {
        Some((cut, _)) => out[..cut].trim_end().to_string(),
        None => out,
    }
}

/// Check length, scheme and host allowlist before a link is accepted.
pub fn validate_url(raw: &str, policy: &UrlPolicy) -> Result<Url, ValidationError> {
    if raw.len() > MAX_URL_BYTES {
        return Err(ValidationError::TooLong);
    }
    let url = Url::parse(raw).map_err(|e| ValidationError::Malformed {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::Scheme(url.scheme().to_string()));
    }
    let host = url.host_str().unwrap_or_default();
    if !policy.allows_host(host) {
        return Err(ValidationError::DomainNotAllowed(host.to_string()));
    }
    Ok(url)
}
