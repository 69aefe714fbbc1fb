//! Link resolution: turn a scraped href into the canonical course URL,
//! following coupon and claim landing pages when needed.

use scout_core::{validate_url, UrlPolicy, ValidationError};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{fetch_document, selector, AdapterError, FailureKind, PageFetcher};

#[derive(Debug, Clone)]
pub struct ResolverPolicy {
    /// Course platform every destination must live on.
    pub target_domain: String,
    pub intermediate_marker: String,
    pub claim_marker: String,
    pub destination_marker: String,
    pub profile_marker: String,
    /// Host substrings identifying affiliate redirectors.
    pub tracking_host_markers: Vec<String>,
    /// Query keys that carry a nested destination URL.
    pub tracking_params: Vec<String>,
    /// Query keys kept on a destination, in output order.
    pub retained_params: Vec<String>,
    pub max_hops: usize,
    pub url_policy: UrlPolicy,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            target_domain: "udemy.com".to_string(),
            intermediate_marker: "/coupon/".to_string(),
            claim_marker: "/claim/".to_string(),
            destination_marker: "/course/".to_string(),
            profile_marker: "/user/".to_string(),
            tracking_host_markers: vec!["linksynergy.com".to_string(), "click.".to_string()],
            tracking_params: vec!["murl".to_string()],
            retained_params: vec!["couponCode".to_string(), "referralCode".to_string()],
            max_hops: 2,
            url_policy: UrlPolicy::default(),
        }
    }
}

/// How the destination was reached. Coupon and claim origins imply a free
/// enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkOrigin {
    Direct,
    Tracking,
    Coupon,
    Claim,
}

impl LinkOrigin {
    pub fn via_landing_page(self) -> bool {
        matches!(self, LinkOrigin::Coupon | LinkOrigin::Claim)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub url: String,
    pub origin: LinkOrigin,
}

impl Resolution {
    /// First query value that is itself an absolute http(s) URL, as carried
    /// by affiliate redirectors.
    pub fn nested_url(&self) -> Option<Url> {
        let url = Url::parse(&self.url).ok()?;
        let nested = url
            .query_pairs()
            .filter_map(|(_, value)| Url::parse(&value).ok())
            .find(|candidate| matches!(candidate.scheme(), "http" | "https"));
        nested
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{url} is not on {domain}")]
    NotTargetDomain { url: String, domain: String },
    #[error("no destination link found starting from {url}")]
    NoDestinationFound { url: String },
    #[error("claim chain from {url} exceeded {hops} hops")]
    ChainDepthExceeded { url: String, hops: usize },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Page(#[from] AdapterError),
}

impl ResolveError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResolveError::Validation(_) => FailureKind::Validation,
            ResolveError::Page(err) => err.kind(),
            _ => FailureKind::Resolution,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PageLinks {
    destination: Option<String>,
    claim: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkResolver {
    policy: ResolverPolicy,
}

impl LinkResolver {
    pub fn new(policy: ResolverPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResolverPolicy {
        &self.policy
    }

    pub fn is_intermediate(&self, href: &str) -> bool {
        href.contains(&self.policy.intermediate_marker)
    }

    /// Absolute hrefs are kept verbatim; relative ones are rooted on the
    /// source page's scheme and host.
    pub fn root(&self, href: &str, source_page: &str) -> Result<String, ResolveError> {
        let href = href.trim();
        if Url::parse(href).is_ok() {
            return Ok(href.to_string());
        }
        let mut base = Url::parse(source_page).map_err(|e| ValidationError::Malformed {
            url: source_page.to_string(),
            reason: e.to_string(),
        })?;
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        let joined = base.join(href).map_err(|e| ValidationError::Malformed {
            url: href.to_string(),
            reason: e.to_string(),
        })?;
        Ok(joined.to_string())
    }

    pub async fn resolve(
        &self,
        fetcher: &dyn PageFetcher,
        href: &str,
        source_page: &str,
    ) -> Result<Resolution, ResolveError> {
        let rooted = self.root(href, source_page)?;
        if self.is_intermediate(&rooted) {
            return self.follow_chain(fetcher, &rooted).await;
        }
        self.normalize_destination(&rooted, LinkOrigin::Direct)
    }

    /// Validate `raw`, then normalize it. Tracking URLs are returned exactly
    /// as given; anything else must be on the target domain and keeps only
    /// the retained query parameters.
    pub fn normalize_destination(&self, raw: &str, origin: LinkOrigin) -> Result<Resolution, ResolveError> {
        let mut url = validate_url(raw, &self.policy.url_policy)?;
        if self.is_tracking(&url) {
            let origin = match origin {
                LinkOrigin::Direct => LinkOrigin::Tracking,
                other => other,
            };
            return Ok(Resolution {
                url: raw.to_string(),
                origin,
            });
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !host.contains(&self.policy.target_domain) {
            return Err(ResolveError::NotTargetDomain {
                url: url.to_string(),
                domain: self.policy.target_domain.clone(),
            });
        }

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let kept: Vec<(&String, &String)> = self
            .policy
            .retained_params
            .iter()
            .filter_map(|key| {
                pairs
                    .iter()
                    .find(|(k, v)| k == key && !v.is_empty())
                    .map(|(k, v)| (k, v))
            })
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
        url.set_fragment(None);

        Ok(Resolution {
            url: url.to_string(),
            origin,
        })
    }

    fn is_tracking(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        self.policy
            .tracking_host_markers
            .iter()
            .any(|marker| host.contains(marker.as_str()))
            || url
                .query_pairs()
                .any(|(key, _)| self.policy.tracking_params.iter().any(|p| *p == key))
    }

    async fn follow_chain(&self, fetcher: &dyn PageFetcher, start: &str) -> Result<Resolution, ResolveError> {
        let mut page_url = start.to_string();
        for hop in 0..self.policy.max_hops {
            let html = fetch_document(fetcher, &page_url).await?;
            let links = self.scan_page(&html, &page_url)?;

            if let Some(destination) = links.destination {
                let origin = if hop == 0 {
                    LinkOrigin::Coupon
                } else {
                    LinkOrigin::Claim
                };
                debug!(hop, page = %page_url, destination = %destination, "destination found");
                return self.normalize_destination(&destination, origin);
            }

            match links.claim {
                Some(claim) if hop + 1 < self.policy.max_hops => {
                    debug!(hop, page = %page_url, claim = %claim, "following claim link");
                    page_url = claim;
                }
                Some(_) => {
                    return Err(ResolveError::ChainDepthExceeded {
                        url: start.to_string(),
                        hops: self.policy.max_hops,
                    })
                }
                None => break,
            }
        }
        Err(ResolveError::NoDestinationFound {
            url: start.to_string(),
        })
    }

    /// Destination preference: a target-domain `/course/` link, else the
    /// first target-domain link that is not a user profile.
    fn scan_page(&self, html: &str, page_url: &str) -> Result<PageLinks, AdapterError> {
        let document = Html::parse_document(html);
        let anchors = selector("a[href]")?;
        let base = Url::parse(page_url).ok();

        let mut course = None;
        let mut fallback = None;
        let mut claim = None;
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            let absolute = match (&base, Url::parse(href)) {
                (_, Ok(_)) => href.to_string(),
                (Some(base), Err(_)) => match base.join(href) {
                    Ok(url) => url.to_string(),
                    Err(_) => continue,
                },
                (None, Err(_)) => continue,
            };

            if absolute.contains(&self.policy.target_domain) {
                if course.is_none() && absolute.contains(&self.policy.destination_marker) {
                    course = Some(absolute);
                } else if fallback.is_none() && !absolute.contains(&self.policy.profile_marker) {
                    fallback = Some(absolute);
                }
            } else if claim.is_none() && absolute.contains(&self.policy.claim_marker) {
                claim = Some(absolute);
            }
        }

        Ok(PageLinks {
            destination: course.or(fallback),
            claim,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CannedPages;

    const SOURCE: &str = "https://coupons.example/free/page/2?sort=new";

    fn resolver() -> LinkResolver {
        LinkResolver::default()
    }

    #[test]
    fn relative_hrefs_are_rooted_on_source_host() {
        let r = resolver();
        assert_eq!(
            r.root("/coupon/rust-basics", SOURCE).unwrap(),
            "https://coupons.example/coupon/rust-basics"
        );
        assert_eq!(
            r.root("coupon/rust-basics", SOURCE).unwrap(),
            "https://coupons.example/coupon/rust-basics"
        );
        assert_eq!(
            r.root("https://www.udemy.com/course/x/", SOURCE).unwrap(),
            "https://www.udemy.com/course/x/"
        );
    }

    #[tokio::test]
    async fn direct_links_keep_only_coupon_and_referral_params() {
        let pages = CannedPages::default();
        let resolution = resolver()
            .resolve(
                &pages,
                "https://www.udemy.com/course/rust-web/?utm_source=x&referralCode=R1&couponCode=JULY2025#reviews",
                SOURCE,
            )
            .await
            .unwrap();
        assert_eq!(
            resolution.url,
            "https://www.udemy.com/course/rust-web/?couponCode=JULY2025&referralCode=R1"
        );
        assert_eq!(resolution.origin, LinkOrigin::Direct);

        let bare = resolver()
            .resolve(&pages, "https://www.udemy.com/course/rust-web/?utm_medium=feed", SOURCE)
            .await
            .unwrap();
        assert_eq!(bare.url, "https://www.udemy.com/course/rust-web/");
        assert!(pages.requested().is_empty());
    }

    #[tokio::test]
    async fn tracking_links_pass_through_untouched() {
        let pages = CannedPages::default();
        let href = "https://click.linksynergy.com/deeplink?id=abc&mid=39197&murl=https%3A%2F%2Fwww.udemy.com%2Fcourse%2Fgo%2F%3FcouponCode%3DAUG2030";
        let resolution = resolver().resolve(&pages, href, SOURCE).await.unwrap();
        assert_eq!(resolution.origin, LinkOrigin::Tracking);
        assert_eq!(resolution.url, href);
        let nested = resolution.nested_url().unwrap();
        assert_eq!(nested.host_str(), Some("www.udemy.com"));
        assert_eq!(
            nested.query_pairs().find(|(k, _)| k == "couponCode").map(|(_, v)| v.into_owned()),
            Some("AUG2030".to_string())
        );
    }

    #[tokio::test]
    async fn tracking_links_are_not_reencoded() {
        let pages = CannedPages::default().with(
            "https://coupons.example/coupon/quoted",
            r#"<a href="https://click.linksynergy.com/deeplink?id=a'b&amp;murl=https://www.udemy.com/course/q/">Get</a>"#,
        );
        let href = "https://click.linksynergy.com/deeplink?id=a'b|c&murl=https://www.udemy.com/course/q/";
        let direct = resolver().resolve(&pages, href, SOURCE).await.unwrap();
        assert_eq!(direct.url, href);

        let via_page = resolver()
            .resolve(&pages, "/coupon/quoted", SOURCE)
            .await
            .unwrap();
        assert_eq!(via_page.origin, LinkOrigin::Coupon);
        assert_eq!(
            via_page.url,
            "https://click.linksynergy.com/deeplink?id=a'b&murl=https://www.udemy.com/course/q/"
        );
    }

    #[tokio::test]
    async fn off_allowlist_direct_links_fail_validation() {
        let pages = CannedPages::default();
        let err = resolver()
            .resolve(&pages, "https://example.org/course/x", SOURCE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[test]
    fn allowlisted_hosts_off_target_are_rejected() {
        let policy = ResolverPolicy {
            url_policy: UrlPolicy {
                allowed_domains: vec!["udemy.com".into(), "courses.example".into()],
            },
            ..ResolverPolicy::default()
        };
        let r = LinkResolver::new(policy);
        let err = r
            .normalize_destination("https://courses.example/course/x", LinkOrigin::Direct)
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotTargetDomain { .. }));
        assert_eq!(err.kind(), FailureKind::Resolution);
    }

    #[tokio::test]
    async fn coupon_page_prefers_course_links_over_profiles() {
        let pages = CannedPages::default().with(
            "https://coupons.example/coupon/rust",
            r#"<html><body>
                <a href="https://www.udemy.com/user/jane/">Instructor</a>
                <a href="https://www.udemy.com/course/rust-pro/?couponCode=FREE1&ref=feed">Enroll</a>
            </body></html>"#,
        );
        let resolution = resolver()
            .resolve(&pages, "/coupon/rust", SOURCE)
            .await
            .unwrap();
        assert_eq!(resolution.url, "https://www.udemy.com/course/rust-pro/?couponCode=FREE1");
        assert_eq!(resolution.origin, LinkOrigin::Coupon);
    }

    #[tokio::test]
    async fn profile_only_coupon_page_follows_the_claim_link() {
        let pages = CannedPages::default()
            .with(
                "https://coupons.example/coupon/python",
                r#"<html><body>
                    <a href="https://www.udemy.com/user/123">Author</a>
                    <a href="/claim/abc">Claim coupon</a>
                </body></html>"#,
            )
            .with(
                "https://coupons.example/claim/abc",
                r#"<html><body>
                    <a href="https://www.udemy.com/course/python-pro/?couponCode=22JULY2030">Go</a>
                </body></html>"#,
            );
        let resolution = resolver()
            .resolve(&pages, "https://coupons.example/coupon/python", SOURCE)
            .await
            .unwrap();
        assert_eq!(
            resolution.url,
            "https://www.udemy.com/course/python-pro/?couponCode=22JULY2030"
        );
        assert_eq!(resolution.origin, LinkOrigin::Claim);
        assert_eq!(
            pages.requested(),
            vec![
                "https://coupons.example/coupon/python".to_string(),
                "https://coupons.example/claim/abc".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn chain_without_destination_fails() {
        let pages = CannedPages::default().with(
            "https://coupons.example/coupon/empty",
            "<html><body><a href=\"https://www.udemy.com/user/9\">x</a></body></html>",
        );
        let err = resolver()
            .resolve(&pages, "/coupon/empty", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoDestinationFound { .. }));
    }

    #[tokio::test]
    async fn claim_chain_is_bounded_at_two_hops() {
        let pages = CannedPages::default()
            .with(
                "https://coupons.example/coupon/loop",
                "<html><a href=\"/claim/one\">claim</a></html>",
            )
            .with(
                "https://coupons.example/claim/one",
                "<html><a href=\"/claim/two\">claim again</a></html>",
            );
        let err = resolver()
            .resolve(&pages, "/coupon/loop", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ChainDepthExceeded { hops: 2, .. }));
        assert_eq!(pages.requested().len(), 2);
    }

    #[tokio::test]
    async fn failed_hop_fetch_is_a_fetch_failure() {
        let pages = CannedPages::default();
        let err = resolver()
            .resolve(&pages, "/coupon/missing", SOURCE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fetch);
    }
}
