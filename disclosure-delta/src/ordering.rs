//! Chronological ordering of period labels.
//!
//! Period labels are opaque to the pipeline; they are only ever compared
//! through a [`PeriodOrdering`].

use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

/// Total order over period labels.
pub trait PeriodOrdering: Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;

    /// Sort labels in place, oldest first.
    fn sort(&self, labels: &mut [String]) {
        labels.sort_by(|a, b| self.compare(a, b));
    }
}

static QUARTER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Q([1-4])[\s_\-/]*((?:19|20)\d{2})\s*$").unwrap());
static YEAR_QUARTER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*((?:19|20)\d{2})[\s_\-/]*Q([1-4])\s*$").unwrap());
static YEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:FY)?\s*((?:19|20)\d{2})\s*$").unwrap());

/// Understands `Q1_2024`, `2024Q1`, `FY2023` and bare years.
///
/// A full year sorts after its four quarters. Labels that match none of the
/// forms sort after every recognised label, lexically among themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChronologicalOrdering;

impl ChronologicalOrdering {
    /// (year, quarter) sort key, with quarter 5 standing for a full year.
    fn key(label: &str) -> Option<(u32, u32)> {
        if let Some(caps) = QUARTER_PATTERN.captures(label) {
            return Some((caps[2].parse().ok()?, caps[1].parse().ok()?));
        }
        if let Some(caps) = YEAR_QUARTER_PATTERN.captures(label) {
            return Some((caps[1].parse().ok()?, caps[2].parse().ok()?));
        }
        if let Some(caps) = YEAR_PATTERN.captures(label) {
            return Some((caps[1].parse().ok()?, 5));
        }
        None
    }
}

impl PeriodOrdering for ChronologicalOrdering {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        match (Self::key(a), Self::key(b)) {
            (Some(ka), Some(kb)) => ka.cmp(&kb).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }
}
