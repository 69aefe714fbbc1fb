use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scout_adapters::{
    LinkOrigin, ListingFetcher, PageFetcher, ResolverPolicy, SourceTarget, CRATE_NAME,
};
use scout_core::Price;
use scout_storage::FetchError;

const SITE: &str = "https://coupons.example";

fn fixture_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/coupon-site")
}

/// Serves the coupon-site fixtures under `SITE`.
struct FixtureSite {
    routes: HashMap<String, PathBuf>,
    hits: Mutex<Vec<String>>,
}

impl FixtureSite {
    fn new() -> Self {
        let root = fixture_root();
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
            hits: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PageFetcher for FixtureSite {
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.hits.lock().unwrap().push(url.to_string());
        match self.routes.get(url) {
            Some(path) => Ok(std::fs::read(path).expect("fixture readable")),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

#[tokio::test]
async fn coupon_site_fixture_scans_into_listings() {
    assert_eq!(CRATE_NAME, "scout-adapters");
    let site = FixtureSite::new();
    let fetcher = ListingFetcher::new(ResolverPolicy::default(), 1000).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();
    let target = SourceTarget {
        source_id: "coupons-example".to_string(),
        listing_url: format!("{SITE}/latest"),
    };

    let scan = fetcher.fetch_source(&site, &target, now).await.unwrap();

    assert_eq!(scan.stats.candidates, 5);
    assert_eq!(scan.stats.emitted, 3);
    assert_eq!(scan.stats.rejected, 1);
    assert_eq!(scan.stats.resolution_failures, 1);
    assert_eq!(
        *site.hits.lock().unwrap(),
        vec![
            format!("{SITE}/latest"),
            format!("{SITE}/coupon/python-bootcamp-2025"),
            format!("{SITE}/claim/abc"),
            format!("{SITE}/coupon/broken-offer"),
        ]
    );

    let python = &scan.listings[0];
    assert_eq!(
        python.url,
        "https://www.udemy.com/course/complete-python-bootcamp/?couponCode=22JULY2025"
    );
    assert_eq!(python.title, "Complete Python Bootcamp 2025");
    assert_eq!(python.category, "Programming");
    assert_eq!(python.price, Price::FreeCoupon);
    assert_eq!(python.discount, "100%");
    assert_eq!((python.rating, python.student_count), (4.6, 48_210));
    assert_eq!(python.expires_at.to_rfc3339(), "2025-07-22T23:59:59+00:00");
    assert!(python.description.starts_with("Learn Python from scratch"));
    // 36.8 rating + 30 audience + 4 keywords + 3 recency
    assert!((python.quality_score - 73.8).abs() < 1e-9);

    let docker = &scan.listings[1];
    assert_eq!(
        docker.url,
        "https://www.udemy.com/course/docker-kubernetes-devops/?couponCode=NOV2030"
    );
    assert_eq!(docker.price, Price::Amount("$94.99".to_string()));
    assert_eq!(docker.discount, "100%");
    assert_eq!(docker.category, "Docker Kubernetes Devops");
    assert_eq!(docker.expires_at.to_rfc3339(), "2030-11-01T23:59:59+00:00");

    let figma = &scan.listings[2];
    assert!(figma.url.starts_with("https://click.linksynergy.com/deeplink?id=Zx9"));
    assert!(figma.url.contains("murl="));
    assert_eq!(figma.category, "Ui Ux Figma");
    assert_eq!(figma.price, Price::Unknown);
    assert_eq!(figma.discount, "100%");
    assert_eq!(figma.expires_at.to_rfc3339(), "2031-12-31T23:59:59+00:00");
}

#[tokio::test]
async fn resolver_follows_claim_link_past_profile_only_coupon_page() {
    let site = FixtureSite::new();
    let fetcher = ListingFetcher::new(ResolverPolicy::default(), 1000).unwrap();
    let resolution = fetcher
        .resolver()
        .resolve(&site, "/coupon/python-bootcamp-2025", &format!("{SITE}/latest"))
        .await
        .unwrap();
    assert_eq!(resolution.origin, LinkOrigin::Claim);
    assert!(!resolution.url.contains("/user/"));
    assert!(resolution.url.contains("/course/complete-python-bootcamp/"));
}
