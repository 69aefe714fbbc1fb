//! Composite quality score used for display ranking and as the primary dedup
//! tie-break.

use chrono::{Datelike, Utc};

/// Title terms that usually mark a full-length course.
pub const POSITIVE_TITLE_TERMS: &[&str] = &[
    "complete",
    "comprehensive",
    "bootcamp",
    "certification",
    "masterclass",
    "professional",
    "advanced",
    "zero to hero",
    "hands-on",
    "projects",
];

/// Title terms that usually mark a short teaser.
pub const NEGATIVE_TITLE_TERMS: &[&str] = &[
    "crash",
    "brief",
    "overview",
    "quick",
    "mini",
    "basics",
    "in 1 hour",
];

/// Score against the current UTC year.
pub fn quality_score(rating: f64, student_count: u64, title: &str, description: &str) -> f64 {
    quality_score_for_year(rating, student_count, title, description, Utc::now().year())
}

/// Sum of independent rating, audience, keyword, description and recency
/// terms, clamped to `[0, 100]`.
pub fn quality_score_for_year(
    rating: f64,
    student_count: u64,
    title: &str,
    description: &str,
    current_year: i32,
) -> f64 {
    let title_lower = title.to_lowercase();
    let total = rating_term(rating)
        + student_term(student_count)
        + keyword_term(&title_lower)
        + description_term(description)
        + recency_term(&title_lower, current_year);
    total.clamp(0.0, 100.0)
}

fn rating_term(rating: f64) -> f64 {
    rating * 8.0
}

fn student_term(student_count: u64) -> f64 {
    match student_count {
        n if n >= 1000 => 30.0,
        n if n >= 500 => 25.0,
        n if n >= 100 => 20.0,
        n if n >= 50 => 15.0,
        n if n >= 10 => 10.0,
        n if n > 0 => 5.0,
        _ => 0.0,
    }
}

fn keyword_term(title_lower: &str) -> f64 {
    let hits = |terms: &[&str]| -> usize {
        terms
            .iter()
            .map(|term| title_lower.matches(term).count())
            .sum()
    };
    let positive = hits(POSITIVE_TITLE_TERMS) as f64;
    let negative = hits(NEGATIVE_TITLE_TERMS) as f64;
    positive * 2.0 - negative * 3.0
}

fn description_term(description: &str) -> f64 {
    let len = description.chars().count();
    let mut score = 0.0;
    if len > 100 {
        score += 5.0;
    }
    if len > 200 {
        score += 3.0;
    }
    score
}

fn recency_term(title_lower: &str, current_year: i32) -> f64 {
    (0..=2)
        .find(|age| title_lower.contains(&(current_year - age).to_string()))
        .map(|age| f64::from(3 - age))
        .unwrap_or(0.0)
}
