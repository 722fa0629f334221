//! Optional cross-check of signals against market commentary.
//!
//! Non-removed records are sent to the search capability, which answers in
//! `SIGNAL:` / `STATUS:` / `REASON:` blocks. Each block is matched back to a
//! record by its description.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capability::{CapabilityError, SearchCapability, Usage};
use crate::settings::PipelineSettings;
use crate::types::{ChangeRecord, MarketValidation};

const SYSTEM_PROMPT: &str = r#"You are a financial market analyst validating signals extracted from company disclosures against real market data.

Search for recent analyst reports, market reactions and financial news for the company's latest results. For EACH signal decide:
- aligned: market data or analyst consensus confirms the signal direction
- divergent: market data or analyst consensus contradicts the signal
- unclear: not enough market data to judge this signal

Format your response as:
SIGNAL: [signal subject exactly as given]
STATUS: [aligned/divergent/unclear]
REASON: [1-2 sentence explanation with market evidence]

Repeat for each signal."#;

/// Result of one market validation pass.
#[derive(Debug, Clone, Default)]
pub struct MarketOutcome {
    /// Aligned / matched × 100, rounded to one decimal
    pub alignment_pct: f64,
    pub sources: Vec<String>,
    pub usage: Usage,
    pub error: Option<CapabilityError>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Verdict {
    status: Option<MarketValidation>,
    reason: String,
}

/// Parse `SIGNAL:` / `STATUS:` / `REASON:` blocks keyed by subject.
fn parse_blocks(text: &str) -> BTreeMap<String, Verdict> {
    let mut results: BTreeMap<String, Verdict> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(subject) = line.strip_prefix("SIGNAL:") {
            current = Some(subject.trim().to_string());
        } else if let Some(status) = line.strip_prefix("STATUS:") {
            if let Some(subject) = &current {
                results.entry(subject.clone()).or_default().status =
                    Some(MarketValidation::parse_lenient(status));
            }
        } else if let Some(reason) = line.strip_prefix("REASON:") {
            if let Some(subject) = &current {
                results.entry(subject.clone()).or_default().reason = reason.trim().to_string();
            }
        }
    }

    results
}

fn words(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `needle` occurs as a contiguous run of whole words in `haystack`.
fn contains_words(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Verdict for a record description: exact subject first, otherwise the
/// subject sharing the longest whole-word run with the description.
fn find_verdict<'a>(results: &'a BTreeMap<String, Verdict>, description: &str) -> Option<&'a Verdict> {
    if let Some(v) = results.get(description) {
        return Some(v);
    }
    let target = words(description);
    if target.is_empty() {
        return None;
    }

    let mut best: Option<(usize, &Verdict)> = None;
    for (subject, verdict) in results {
        let subject = words(subject);
        let overlap = if contains_words(&target, &subject) {
            subject.len()
        } else if contains_words(&subject, &target) {
            target.len()
        } else {
            continue;
        };
        if best.map_or(true, |(score, _)| overlap > score) {
            best = Some((overlap, verdict));
        }
    }
    best.map(|(_, verdict)| verdict)
}

/// Annotates records with market agreement.
#[derive(Clone)]
pub struct MarketValidator {
    search: Arc<dyn SearchCapability>,
    settings: Arc<PipelineSettings>,
}

impl MarketValidator {
    pub fn new(search: Arc<dyn SearchCapability>, settings: Arc<PipelineSettings>) -> Self {
        Self { search, settings }
    }

    /// Annotate non-removed records in place.
    ///
    /// Every such record starts Unclear; a failed search leaves it that way.
    pub async fn validate(&self, records: &mut [ChangeRecord]) -> MarketOutcome {
        let mut candidates: Vec<&mut ChangeRecord> =
            records.iter_mut().filter(|r| !r.is_removed()).collect();
        if candidates.is_empty() {
            return MarketOutcome {
                alignment_pct: 100.0,
                ..Default::default()
            };
        }

        for record in candidates.iter_mut() {
            record.market_validation = Some(MarketValidation::Unclear);
            record.market_note.clear();
        }

        let entity = candidates[0].entity.clone();
        let quarter = candidates[0].quarter_curr.clone();
        let signals = candidates
            .iter()
            .map(|r| {
                format!(
                    "- {}: {} (score: {:+.1}) [{}]",
                    r.description, r.signal_classification, r.signal_score, r.section
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let payload = format!(
            "Validate these signals for **{entity}** ({quarter}) against real market data:\n\n\
             SIGNALS TO VALIDATE:\n{signals}\n\n\
             Search for analyst reports, broker notes and market commentary on {entity}'s {quarter} results."
        );

        let call = self.search.search_and_summarize(SYSTEM_PROMPT, &payload);
        let result = match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Self::failed(&entity, e),
            Err(_) => return Self::failed(&entity, CapabilityError::Timeout(self.settings.call_timeout)),
        };

        let results = parse_blocks(&result.text);
        let mut aligned = 0usize;
        let mut checked = 0usize;

        for record in candidates.iter_mut() {
            let Some(verdict) = find_verdict(&results, &record.description) else {
                continue;
            };
            let status = verdict.status.unwrap_or(MarketValidation::Unclear);
            record.market_validation = Some(status);
            record.market_note = verdict.reason.clone();
            checked += 1;

            match status {
                MarketValidation::Aligned => aligned += 1,
                MarketValidation::Divergent => warn!(
                    entity = %record.entity,
                    description = %record.description,
                    note = %record.market_note,
                    "Market divergence"
                ),
                MarketValidation::Unclear => {}
            }
        }

        let alignment_pct = if checked == 0 {
            0.0
        } else {
            (aligned as f64 * 1000.0 / checked as f64).round() / 10.0
        };
        info!(
            entity = %entity,
            quarter = %quarter,
            aligned,
            checked,
            sources = result.sources.len(),
            "Market validation finished"
        );

        MarketOutcome {
            alignment_pct,
            sources: result.sources,
            usage: result.usage,
            error: None,
        }
    }

    fn failed(entity: &str, error: CapabilityError) -> MarketOutcome {
        warn!(entity = %entity, error = %error, "Market search failed");
        MarketOutcome {
            alignment_pct: 0.0,
            sources: Vec::new(),
            usage: Usage::default(),
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SearchResult;
    use crate::types::{Section, SignalClassification, ValidationStatus};
    use async_trait::async_trait;

    struct Search(Result<String, CapabilityError>);

    #[async_trait]
    impl SearchCapability for Search {
        async fn search_and_summarize(
            &self,
            _system: &str,
            _payload: &str,
        ) -> Result<SearchResult, CapabilityError> {
            self.0.clone().map(|text| SearchResult {
                text,
                sources: vec!["https://news.example.com/acme".into()],
                usage: Usage::default(),
            })
        }
    }

    fn record(description: &str, status: ValidationStatus) -> ChangeRecord {
        ChangeRecord {
            entity: "ACME".into(),
            section: Section::MdA,
            quarter_prev: "Q1_2024".into(),
            quarter_curr: "Q2_2024".into(),
            quote_old: "old".into(),
            quote_new: "new".into(),
            description: description.into(),
            signal_classification: SignalClassification::Positive,
            signal_score: 3.0,
            validation_status: Some(status),
            validation_note: String::new(),
            market_validation: None,
            market_note: String::new(),
        }
    }

    fn validator(reply: Result<&str, CapabilityError>) -> MarketValidator {
        MarketValidator::new(
            Arc::new(Search(reply.map(str::to_string))),
            Arc::new(PipelineSettings::default()),
        )
    }

    #[test]
    fn test_parse_blocks() {
        let text = "STATUS: orphan\nSIGNAL: Demand recovery\nSTATUS: Aligned\nREASON: Brokers upgraded.\n\nSIGNAL: Margin\nSTATUS: sideways";
        let results = parse_blocks(text);
        assert_eq!(results.len(), 2);
        assert_eq!(results["Demand recovery"].status, Some(MarketValidation::Aligned));
        assert_eq!(results["Demand recovery"].reason, "Brokers upgraded.");
        assert_eq!(results["Margin"].status, Some(MarketValidation::Unclear));
    }

    #[tokio::test]
    async fn test_annotates_and_computes_alignment() {
        let reply = "SIGNAL: Demand recovery\nSTATUS: aligned\nREASON: Upgrades\n\
                     SIGNAL: margin pressure\nSTATUS: divergent\nREASON: Margins beat";
        let mut records = vec![
            record("Demand recovery", ValidationStatus::Verified),
            record("Margin pressure eased", ValidationStatus::Flagged),
            record("Fabricated claim", ValidationStatus::Removed),
        ];

        let outcome = validator(Ok(reply)).validate(&mut records).await;

        assert_eq!(records[0].market_validation, Some(MarketValidation::Aligned));
        assert_eq!(records[1].market_validation, Some(MarketValidation::Divergent));
        assert_eq!(records[1].market_note, "Margins beat");
        assert_eq!(records[2].market_validation, None);
        assert_eq!(outcome.alignment_pct, 50.0);
        assert_eq!(outcome.sources.len(), 1);
    }

    #[test]
    fn test_subject_matching_uses_whole_words_and_best_overlap() {
        let results = parse_blocks(
            "SIGNAL: Margin\nSTATUS: divergent\n\
             SIGNAL: gross margin expansion\nSTATUS: aligned\n\
             SIGNAL: Demand\nSTATUS: aligned",
        );

        let status = |d: &str| find_verdict(&results, d).and_then(|v| v.status);
        assert_eq!(status("Gross margin expansion continued"), Some(MarketValidation::Aligned));
        assert_eq!(status("Margin held"), Some(MarketValidation::Divergent));
        // "Margin" is not a whole word of "Marginal" or "margins"
        assert_eq!(status("Marginal customers churned"), None);
        assert_eq!(status("Operating margins"), None);
        assert_eq!(status("Demand-led growth"), Some(MarketValidation::Aligned));
    }

    #[tokio::test]
    async fn test_failure_leaves_unclear() {
        let mut records = vec![record("Demand recovery", ValidationStatus::Verified)];
        let outcome = validator(Err(CapabilityError::Unavailable("down".into())))
            .validate(&mut records)
            .await;

        assert!(outcome.error.is_some());
        assert_eq!(records[0].market_validation, Some(MarketValidation::Unclear));
    }

    #[tokio::test]
    async fn test_nothing_to_validate() {
        let mut records = vec![record("Gone", ValidationStatus::Removed)];
        let outcome = validator(Ok("")).validate(&mut records).await;
        assert_eq!(outcome.alignment_pct, 100.0);
        assert_eq!(records[0].market_validation, None);
    }
}
