//! Heuristic field extraction from one listing anchor and its surrounding
//! block of markup.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use scout_core::validation::MAX_TEXT_CHARS;
use scout_core::{sanitize, Price, DEFAULT_CATEGORY, MAX_TITLE_CHARS, MIN_TITLE_CHARS};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::resolve::Resolution;
use crate::{selector, AdapterError};

/// Characters of container text searched for "4.5 (1,234 students)".
pub const RATING_WINDOW_CHARS: usize = 200;

const BLOCK_TAGS: &[&str] = &["article", "li", "tr", "div", "section"];

const FREE_TOKENS: &[&str] = &["free", "gratis", "100% off"];

const URGENCY_TOKENS: &[&str] = &["limited", "special", "exclusive"];

const COUPON_PARAM: &str = "couponCode";

/// Ordered title keyword table; the first matching entry wins.
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("machine learning", "Data Science"),
    ("deep learning", "Data Science"),
    ("data science", "Data Science"),
    ("data analysis", "Data Science"),
    ("tensorflow", "Data Science"),
    ("pandas", "Data Science"),
    ("react", "Web Development"),
    ("angular", "Web Development"),
    ("vue", "Web Development"),
    ("django", "Web Development"),
    ("wordpress", "Web Development"),
    ("html", "Web Development"),
    ("css", "Web Development"),
    ("web development", "Web Development"),
    ("python", "Programming"),
    ("javascript", "Programming"),
    ("typescript", "Programming"),
    ("java", "Programming"),
    ("golang", "Programming"),
    ("rust", "Programming"),
    ("c++", "Programming"),
    ("c#", "Programming"),
    ("programming", "Programming"),
    ("coding", "Programming"),
    ("aws", "IT & Software"),
    ("azure", "IT & Software"),
    ("docker", "IT & Software"),
    ("kubernetes", "IT & Software"),
    ("devops", "IT & Software"),
    ("linux", "IT & Software"),
    ("cyber", "IT & Software"),
    ("hacking", "IT & Software"),
    ("excel", "Office Productivity"),
    ("power bi", "Office Productivity"),
    ("photoshop", "Design"),
    ("illustrator", "Design"),
    ("figma", "Design"),
    ("design", "Design"),
    ("seo", "Marketing"),
    ("marketing", "Marketing"),
    ("social media", "Marketing"),
    ("accounting", "Finance & Accounting"),
    ("trading", "Finance & Accounting"),
    ("investing", "Finance & Accounting"),
    ("finance", "Finance & Accounting"),
    ("project management", "Business"),
    ("leadership", "Business"),
    ("entrepreneur", "Business"),
    ("business", "Business"),
    ("photography", "Photography & Video"),
    ("video editing", "Photography & Video"),
    ("guitar", "Music"),
    ("piano", "Music"),
    ("music", "Music"),
    ("yoga", "Health & Fitness"),
    ("fitness", "Health & Fitness"),
    ("nutrition", "Health & Fitness"),
    ("english", "Language"),
    ("spanish", "Language"),
];

/// Full names before abbreviations so the alternation prefers "july" to "jul".
const MONTHS: &[(&str, u32)] = &[
    ("september", 9),
    ("february", 2),
    ("november", 11),
    ("december", 12),
    ("january", 1),
    ("october", 10),
    ("august", 8),
    ("march", 3),
    ("april", 4),
    ("june", 6),
    ("july", 7),
    ("sept", 9),
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

fn rating_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*\(\s*(\d[\d,]*)\s*students?\s*\)").unwrap())
}

fn currency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[£$€¥₹]\s?\d+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?\s?[£$€¥₹]").unwrap()
    })
}

fn bare_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d{1,2})?").unwrap())
}

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})\s?%").unwrap())
}

fn month_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = MONTHS.iter().map(|(name, _)| *name).collect::<Vec<_>>().join("|");
        Regex::new(&format!(r"(?i)(\d{{1,2}})?({names})(20\d{{2}})")).unwrap()
    })
}

fn bare_year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"20\d{2}").unwrap())
}

/// Everything the extractor needs from one anchor, captured while the parsed
/// document is alive so extraction itself is pure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorSnapshot {
    pub href: String,
    pub text: String,
    pub parent_text: String,
    pub title_attr: Option<String>,
    /// Container text right after the anchor's title, at most
    /// `RATING_WINDOW_CHARS`; empty when the title is not in the container.
    pub rating_text: String,
    pub description_text: Option<String>,
    pub category_text: Option<String>,
    pub price_text: Option<String>,
    pub discount_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub title: String,
    pub description: String,
    pub category: String,
    pub rating: f64,
    pub student_count: u64,
    pub price: Price,
    pub discount: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractRejection {
    #[error("title too short: {title:?}")]
    TitleTooShort { title: String },
}

#[derive(Debug, Clone)]
struct MarkerSelectors {
    description: Selector,
    category: Selector,
    price: Selector,
    discount: Selector,
}

/// Shared inputs for the per-field strategy chains.
struct ExtractionContext<'a> {
    snapshot: &'a AnchorSnapshot,
    resolution: &'a Resolution,
    title: &'a str,
    destination_marker: &'a str,
    resolved: Option<Url>,
    nested: Option<Url>,
    now: DateTime<Utc>,
}

impl ExtractionContext<'_> {
    /// Destination URL with real course path and parameters: the nested one
    /// when a redirector wraps it.
    fn destination(&self) -> Option<&Url> {
        self.nested.as_ref().or(self.resolved.as_ref())
    }

    fn coupon_code(&self) -> Option<String> {
        let lookup = |url: &Url| {
            url.query_pairs()
                .find(|(key, value)| key == COUPON_PARAM && !value.is_empty())
                .map(|(_, value)| value.into_owned())
        };
        self.nested
            .as_ref()
            .and_then(lookup)
            .or_else(|| self.resolved.as_ref().and_then(lookup))
    }
}

type Strategy<T> = fn(&ExtractionContext<'_>) -> Option<T>;

const CATEGORY_STRATEGIES: &[Strategy<String>] =
    &[category_from_marker, category_from_course_path, category_from_keywords];

const PRICE_STRATEGIES: &[Strategy<Price>] = &[price_from_origin, price_from_marker];

const DISCOUNT_STRATEGIES: &[Strategy<String>] =
    &[discount_from_marker, discount_from_coupon_param];

const EXPIRY_STRATEGIES: &[Strategy<DateTime<Utc>>] = &[expiry_from_coupon_code, expiry_from_urgency];

fn first_match<T>(strategies: &[Strategy<T>], ctx: &ExtractionContext<'_>) -> Option<T> {
    strategies.iter().find_map(|strategy| strategy(ctx))
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    markers: MarkerSelectors,
    destination_marker: String,
}

impl FieldExtractor {
    pub fn new(destination_marker: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            markers: MarkerSelectors {
                description: selector(".description, .course-description, .desc, .excerpt, .summary")?,
                category: selector(".category, .course-category, .breadcrumb, .tag, [rel=tag]")?,
                price: selector(".price, .course-price, .sale-price, .current-price")?,
                discount: selector(".discount, .course-discount, .off, .badge")?,
            },
            destination_marker: destination_marker.to_string(),
        })
    }

    /// Capture the anchor's text and the marker texts of its closest block
    /// container: the nearest block-level ancestor whose text is longer than
    /// the anchor's own, else the direct parent.
    pub fn snapshot(&self, anchor: ElementRef<'_>) -> AnchorSnapshot {
        let text = element_text(anchor, MAX_TEXT_CHARS);
        let parent = anchor.parent().and_then(ElementRef::wrap);
        let parent_text = parent
            .map(|p| element_text(p, MAX_TEXT_CHARS))
            .unwrap_or_default();

        let anchor_len = text.chars().count();
        let container = anchor
            .ancestors()
            .filter_map(ElementRef::wrap)
            .filter(|el| BLOCK_TAGS.contains(&el.value().name()))
            .find(|el| element_text(*el, anchor_len + 1).chars().count() > anchor_len)
            .or(parent);
        let rating_text = container
            .map(|c| {
                let full = element_text(c, usize::MAX);
                rating_window(&full, title_source(&text, &parent_text)).to_string()
            })
            .unwrap_or_default();

        let marker = |sel: &Selector| -> Option<String> {
            container.and_then(|c| {
                c.select(sel)
                    .map(|el| element_text(el, MAX_TEXT_CHARS))
                    .find(|t| !t.is_empty())
            })
        };

        AnchorSnapshot {
            href: anchor.value().attr("href").unwrap_or_default().trim().to_string(),
            text,
            parent_text,
            title_attr: anchor
                .value()
                .attr("title")
                .map(|t| sanitize(t, MAX_TEXT_CHARS))
                .filter(|t| !t.is_empty()),
            rating_text,
            description_text: marker(&self.markers.description),
            category_text: marker(&self.markers.category),
            price_text: marker(&self.markers.price),
            discount_text: marker(&self.markers.discount),
        }
    }

    pub fn extract(
        &self,
        snapshot: &AnchorSnapshot,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<ExtractedFields, ExtractRejection> {
        let title = sanitize(
            title_source(&snapshot.text, &snapshot.parent_text),
            MAX_TEXT_CHARS,
        );
        if title.chars().count() < MIN_TITLE_CHARS {
            return Err(ExtractRejection::TitleTooShort { title });
        }
        let title = sanitize(&title, MAX_TITLE_CHARS);

        let description = snapshot
            .title_attr
            .as_deref()
            .or(snapshot.description_text.as_deref())
            .map(|d| sanitize(d, MAX_TEXT_CHARS))
            .unwrap_or_default();

        let resolved = Url::parse(&resolution.url).ok();
        let ctx = ExtractionContext {
            snapshot,
            resolution,
            title: &title,
            destination_marker: &self.destination_marker,
            nested: resolution.nested_url(),
            resolved,
            now,
        };

        let category = first_match(CATEGORY_STRATEGIES, &ctx)
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let (rating, student_count) = rating_and_students(&snapshot.rating_text);
        let price = first_match(PRICE_STRATEGIES, &ctx).unwrap_or(Price::Unknown);
        let discount = if price.is_free() {
            "100%".to_string()
        } else {
            first_match(DISCOUNT_STRATEGIES, &ctx).unwrap_or_else(|| "0%".to_string())
        };
        let expires_at = first_match(EXPIRY_STRATEGIES, &ctx).unwrap_or(now + Duration::days(7));

        Ok(ExtractedFields {
            title,
            description,
            category: sanitize(&category, MAX_TEXT_CHARS),
            rating,
            student_count,
            price,
            discount,
            expires_at,
        })
    }
}

/// Anchor text, or the parent's text when the anchor has none.
fn title_source<'a>(text: &'a str, parent_text: &'a str) -> &'a str {
    if text.is_empty() {
        parent_text
    } else {
        text
    }
}

fn element_text(el: ElementRef<'_>, max_chars: usize) -> String {
    sanitize(&el.text().collect::<Vec<_>>().join(" "), max_chars)
}

fn slug_after(path: &str, marker: &str) -> Option<String> {
    let (_, rest) = path.split_once(marker)?;
    let slug = rest.split('/').next().unwrap_or_default();
    (!slug.is_empty()).then(|| slug.to_string())
}

fn title_case_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn category_from_marker(ctx: &ExtractionContext<'_>) -> Option<String> {
    ctx.snapshot.category_text.clone().filter(|c| !c.is_empty())
}

fn category_from_course_path(ctx: &ExtractionContext<'_>) -> Option<String> {
    ctx.destination()
        .and_then(|url| slug_after(url.path(), ctx.destination_marker))
        .map(|slug| title_case_slug(&slug))
}

fn category_from_keywords(ctx: &ExtractionContext<'_>) -> Option<String> {
    let lower = ctx.title.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| category.to_string())
}

/// The text right after `title` inside the container, so neighbouring
/// listings in one region don't bleed into each other. Empty when the title
/// is not found.
fn rating_window<'a>(container_text: &'a str, title: &str) -> &'a str {
    if title.is_empty() {
        return "";
    }
    let Some(offset) = container_text.find(title) else {
        return "";
    };
    let tail = container_text[offset + title.len()..].trim_start();
    let end = tail
        .char_indices()
        .nth(RATING_WINDOW_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(tail.len());
    &tail[..end]
}

fn rating_and_students(window: &str) -> (f64, u64) {
    rating_regex()
        .captures_iter(window)
        .find_map(|caps| {
            let rating: f64 = caps.get(1)?.as_str().parse().ok()?;
            if !(rating > 0.0 && rating <= 5.0) {
                return None;
            }
            let students: u64 = caps.get(2)?.as_str().replace(',', "").parse().ok()?;
            Some((rating, students))
        })
        .unwrap_or((0.0, 0))
}

fn contains_free_token(text: &str) -> bool {
    let lower = text.to_lowercase();
    FREE_TOKENS.iter().any(|token| lower.contains(token))
}

fn price_from_origin(ctx: &ExtractionContext<'_>) -> Option<Price> {
    ctx.resolution
        .origin
        .via_landing_page()
        .then_some(Price::FreeCoupon)
}

fn price_from_marker(ctx: &ExtractionContext<'_>) -> Option<Price> {
    let text = ctx.snapshot.price_text.as_deref()?;
    if contains_free_token(text) {
        return Some(Price::Free);
    }
    if let Some(amount) = currency_regex().find(text) {
        return Some(Price::Amount(amount.as_str().to_string()));
    }
    bare_number_regex()
        .find(text)
        .map(|n| Price::Amount(format!("${}", n.as_str())))
}

fn discount_from_marker(ctx: &ExtractionContext<'_>) -> Option<String> {
    let text = ctx.snapshot.discount_text.as_deref()?;
    if let Some(caps) = percent_regex().captures(text) {
        return Some(format!("{}%", &caps[1]));
    }
    contains_free_token(text).then(|| "100%".to_string())
}

fn discount_from_coupon_param(ctx: &ExtractionContext<'_>) -> Option<String> {
    ctx.coupon_code().map(|_| "100%".to_string())
}

fn expiry_from_coupon_code(ctx: &ExtractionContext<'_>) -> Option<DateTime<Utc>> {
    let code = ctx.coupon_code()?;
    parse_coupon_date(&code, ctx.now.year())
}

fn expiry_from_urgency(ctx: &ExtractionContext<'_>) -> Option<DateTime<Utc>> {
    let lower = ctx.title.to_lowercase();
    URGENCY_TOKENS
        .iter()
        .any(|token| lower.contains(token))
        .then(|| ctx.now + Duration::days(2))
}

/// Decode an expiry embedded in a coupon code.
///
/// `<day>?<month name><year>` (year not before `current_year`, day defaults
/// to 1) wins over a bare `20xx` year, which means December 31 of that year.
/// Both resolve to 23:59:59 UTC.
pub fn parse_coupon_date(code: &str, current_year: i32) -> Option<DateTime<Utc>> {
    let end_of_day = |date: NaiveDate| date.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc());

    let from_month = month_date_regex().captures_iter(code).find_map(|caps| {
        let year: i32 = caps.get(3)?.as_str().parse().ok()?;
        if year < current_year {
            return None;
        }
        let name = caps.get(2)?.as_str().to_lowercase();
        let month = MONTHS.iter().find(|(n, _)| *n == name)?.1;
        let day = match caps.get(1) {
            Some(d) => d.as_str().parse().ok()?,
            None => 1,
        };
        end_of_day(NaiveDate::from_ymd_opt(year, month, day)?)
    });
    if from_month.is_some() {
        return from_month;
    }

    let year: i32 = bare_year_regex().find(code)?.as_str().parse().ok()?;
    end_of_day(NaiveDate::from_ymd_opt(year, 12, 31)?)
}
