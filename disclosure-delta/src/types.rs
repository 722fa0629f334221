//! Core data model of the disclosure delta pipeline.
//!
//! Defines the change record produced per (entity, section, quarter pair),
//! its classification and validation enums, and the per-pair verdict.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parsed disclosures: entity → period label → section name → section text.
pub type Corpus = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// Topical bucket a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Section {
    /// Management discussion and analysis
    #[serde(rename = "MD&A")]
    MdA,
    /// Risk factor disclosures
    #[serde(rename = "Risk_Factors")]
    RiskFactors,
    /// Accounting policies and estimates
    #[serde(rename = "Accounting")]
    Accounting,
}

impl Section {
    /// Every section, in report order.
    pub const ALL: [Section; 3] = [Section::MdA, Section::RiskFactors, Section::Accounting];

    /// Label used in corpus files, cache keys and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::MdA => "MD&A",
            Section::RiskFactors => "Risk_Factors",
            Section::Accounting => "Accounting",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "md&a" | "mda" | "md_a" => Ok(Section::MdA),
            "risk_factors" | "risk factors" | "risk" => Ok(Section::RiskFactors),
            "accounting" => Ok(Section::Accounting),
            other => Err(format!("unknown section '{}'", other)),
        }
    }
}

/// Direction of a single change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalClassification {
    Positive,
    Negative,
    Noise,
}

impl SignalClassification {
    /// Lenient parse of a model-supplied label. Anything unrecognised is Noise.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "positive" | "bullish" | "improving" => SignalClassification::Positive,
            "negative" | "bearish" | "deteriorating" => SignalClassification::Negative,
            _ => SignalClassification::Noise,
        }
    }

    /// Whether `score` carries the sign this classification requires.
    ///
    /// Noise tolerates scores with magnitude up to `noise_threshold`.
    pub fn agrees_with(&self, score: f64, noise_threshold: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match self {
            SignalClassification::Positive => score > 0.0,
            SignalClassification::Negative => score < 0.0,
            SignalClassification::Noise => score.abs() <= noise_threshold,
        }
    }
}

impl fmt::Display for SignalClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalClassification::Positive => "Positive",
            SignalClassification::Negative => "Negative",
            SignalClassification::Noise => "Noise",
        };
        f.write_str(s)
    }
}

/// Outcome of cross validation, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationStatus {
    Verified,
    Flagged,
    Removed,
}

impl ValidationStatus {
    /// Lenient parse of a model-supplied status.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "verified" | "valid" | "ok" => Some(ValidationStatus::Verified),
            "flagged" | "flag" | "warning" => Some(ValidationStatus::Flagged),
            "removed" | "remove" | "fabricated" | "invalid" => Some(ValidationStatus::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationStatus::Verified => "Verified",
            ValidationStatus::Flagged => "Flagged",
            ValidationStatus::Removed => "Removed",
        };
        f.write_str(s)
    }
}

/// Whether market reaction agrees with a change's signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketValidation {
    Aligned,
    Divergent,
    Unclear,
}

impl MarketValidation {
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "aligned" => MarketValidation::Aligned,
            "divergent" => MarketValidation::Divergent,
            _ => MarketValidation::Unclear,
        }
    }
}

/// One detected semantic shift between two periods for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity: String,
    pub section: Section,
    pub quarter_prev: String,
    pub quarter_curr: String,
    pub quote_old: String,
    pub quote_new: String,
    pub description: String,
    pub signal_classification: SignalClassification,
    pub signal_score: f64,
    /// Absent until cross validation has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    /// Empty iff the record is Verified
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub validation_note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_validation: Option<MarketValidation>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub market_note: String,
}

impl ChangeRecord {
    /// Status used for counting; unvalidated records count as Flagged.
    pub fn effective_status(&self) -> ValidationStatus {
        self.validation_status.unwrap_or(ValidationStatus::Flagged)
    }

    pub fn is_removed(&self) -> bool {
        self.validation_status == Some(ValidationStatus::Removed)
    }

    /// Pair this record belongs to.
    pub fn pair(&self) -> PairContext {
        PairContext::new(&self.entity, &self.quarter_prev, &self.quarter_curr)
    }
}

/// Identity of one (entity, quarter pair) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairContext {
    pub entity: String,
    pub quarter_prev: String,
    pub quarter_curr: String,
}

impl PairContext {
    pub fn new(entity: &str, quarter_prev: &str, quarter_curr: &str) -> Self {
        Self {
            entity: entity.to_string(),
            quarter_prev: quarter_prev.to_string(),
            quarter_curr: quarter_curr.to_string(),
        }
    }

    /// Flat string form used for persisted summaries.
    pub fn encode(&self) -> String {
        join_escaped(&[
            self.entity.as_str(),
            self.quarter_prev.as_str(),
            self.quarter_curr.as_str(),
        ])
    }

    /// Inverse of [`PairContext::encode`].
    pub fn decode(s: &str) -> Option<Self> {
        let [entity, quarter_prev, quarter_curr] = split_escaped(s)?;
        Some(Self {
            entity,
            quarter_prev,
            quarter_curr,
        })
    }

    /// Cache key of one section of this pair.
    pub fn key(&self, section: Section) -> CacheKey {
        CacheKey {
            pair: self.clone(),
            section,
        }
    }
}

impl fmt::Display for PairContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}→{}", self.entity, self.quarter_prev, self.quarter_curr)
    }
}

/// Cache identity: (entity, quarter_prev, quarter_curr, section).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub pair: PairContext,
    pub section: Section,
}

impl CacheKey {
    /// Flat string form used in the persisted snapshot.
    pub fn encode(&self) -> String {
        join_escaped(&[
            self.pair.entity.as_str(),
            self.pair.quarter_prev.as_str(),
            self.pair.quarter_curr.as_str(),
            self.section.as_str(),
        ])
    }

    /// Inverse of [`CacheKey::encode`].
    pub fn decode(s: &str) -> Option<Self> {
        let [entity, quarter_prev, quarter_curr, section] = split_escaped(s)?;
        Some(Self {
            pair: PairContext::new(&entity, &quarter_prev, &quarter_curr),
            section: section.parse().ok()?,
        })
    }
}

/// Join fields with `|`, escaping `|` and `\` inside a field with `\`.
fn join_escaped(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| field.replace('\\', "\\\\").replace('|', "\\|"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Inverse of [`join_escaped`]; `None` unless exactly `N` fields come back.
fn split_escaped<const N: usize>(s: &str) -> Option<[String; N]> {
    let mut fields = Vec::with_capacity(N);
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next()?),
            '|' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields.try_into().ok()
}

/// Directional label of an aggregated verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverallSignal {
    Positive,
    Negative,
    Mixed,
    Noise,
}

impl fmt::Display for OverallSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallSignal::Positive => "Positive",
            OverallSignal::Negative => "Negative",
            OverallSignal::Mixed => "Mixed",
            OverallSignal::Noise => "Noise",
        };
        f.write_str(s)
    }
}

/// Aggregated signal for one entity's quarter-to-quarter comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateVerdict {
    pub entity: String,
    pub quarter_prev: String,
    pub quarter_curr: String,
    pub overall_score: f64,
    pub overall_signal: OverallSignal,
    pub summary: String,
    pub verified_count: usize,
    pub flagged_count: usize,
    pub removed_count: usize,
    /// Flagged records whose capability audit never completed
    #[serde(default)]
    pub unresolved_count: usize,
}
