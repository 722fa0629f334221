//! Per-pair signal aggregation and narrative synthesis.
//!
//! The numeric verdict is a pure function of the records. The narrative
//! summary comes from a separate capability call with a deterministic
//! fallback, so a failed synthesis never changes the score.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use disclosure_common::util::char_prefix;

use crate::capability::{decode_structured, CapabilityError, ExtractionCapability, ExtractionRequest};
use crate::types::{AggregateVerdict, ChangeRecord, OverallSignal, PairContext, ValidationStatus};
use crate::validator::PARTIAL_VALIDATION;

/// Scores above this are Positive, below its negation Negative.
pub const DIRECTIONAL_THRESHOLD: f64 = 2.0;

/// Scores with magnitude above this (and not directional) are Mixed.
pub const MIXED_THRESHOLD: f64 = 0.5;

const SYNTHESIS_INPUT_CHARS: usize = 20_000;

/// Deterministic score aggregation.
#[derive(Debug, Clone, Copy)]
pub struct SignalAggregator {
    score_bound: f64,
}

impl SignalAggregator {
    pub fn new(score_bound: f64) -> Self {
        Self { score_bound }
    }

    /// Map a score to its categorical label.
    pub fn classify(score: f64) -> OverallSignal {
        if score > DIRECTIONAL_THRESHOLD {
            OverallSignal::Positive
        } else if score < -DIRECTIONAL_THRESHOLD {
            OverallSignal::Negative
        } else if score.abs() > MIXED_THRESHOLD {
            OverallSignal::Mixed
        } else {
            OverallSignal::Noise
        }
    }

    /// Aggregate a pair's records. The summary is left empty.
    ///
    /// Removed records are excluded from the mean; an empty eligible set
    /// yields `(0.0, Noise)`.
    pub fn aggregate(&self, ctx: &PairContext, records: &[ChangeRecord]) -> AggregateVerdict {
        let scores: Vec<f64> = records
            .iter()
            .filter(|r| !r.is_removed())
            .map(|r| r.signal_score)
            .filter(|s| s.is_finite())
            .collect();

        let overall_score = if scores.is_empty() {
            0.0
        } else {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            let rounded = (mean * 100.0).round() / 100.0;
            rounded.clamp(-self.score_bound, self.score_bound)
        };

        let mut verdict = AggregateVerdict {
            entity: ctx.entity.clone(),
            quarter_prev: ctx.quarter_prev.clone(),
            quarter_curr: ctx.quarter_curr.clone(),
            overall_score,
            overall_signal: Self::classify(overall_score),
            summary: String::new(),
            verified_count: 0,
            flagged_count: 0,
            removed_count: 0,
            unresolved_count: 0,
        };

        for record in records {
            match record.effective_status() {
                ValidationStatus::Verified => verdict.verified_count += 1,
                ValidationStatus::Flagged => verdict.flagged_count += 1,
                ValidationStatus::Removed => verdict.removed_count += 1,
            }
            if record.validation_note.starts_with(PARTIAL_VALIDATION) {
                verdict.unresolved_count += 1;
            }
        }

        verdict
    }
}

const SYSTEM_PROMPT: &str = "You are a senior investment strategist and credit analyst. \
Review a list of quarterly disclosure changes and write a short synthesis: the most impactful \
shifts, ignoring noise, and what they mean for the company's trajectory. \
Return JSON with keys 'insights' and 'verdict'.";

#[derive(Debug, Default, Deserialize)]
struct Synthesis {
    #[serde(default)]
    insights: String,
    #[serde(default)]
    verdict: String,
}

/// A verdict summary and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Narrative {
    pub summary: String,
    /// False when the summary stands in for a failed capability call.
    pub complete: bool,
}

/// Writes the narrative summary of a verdict.
#[derive(Clone)]
pub struct NarrativeSynthesizer {
    capability: Arc<dyn ExtractionCapability>,
    call_timeout: std::time::Duration,
}

impl NarrativeSynthesizer {
    pub fn new(capability: Arc<dyn ExtractionCapability>, call_timeout: std::time::Duration) -> Self {
        Self {
            capability,
            call_timeout,
        }
    }

    /// Summary used when there is nothing to synthesise or the call fails.
    pub fn fallback(verdict: &AggregateVerdict, eligible: usize) -> String {
        if eligible == 0 {
            format!(
                "No significant changes detected between {} and {} for {}.",
                verdict.quarter_prev, verdict.quarter_curr, verdict.entity
            )
        } else {
            format!(
                "{} signal ({:+.2}) for {} between {} and {} across {} change(s): {} verified, {} flagged, {} removed.",
                verdict.overall_signal,
                verdict.overall_score,
                verdict.entity,
                verdict.quarter_prev,
                verdict.quarter_curr,
                eligible,
                verdict.verified_count,
                verdict.flagged_count,
                verdict.removed_count
            )
        }
    }

    /// Narrative for a verdict over its non-removed records.
    ///
    /// With no eligible records the fallback text is the complete summary.
    /// A failed call also yields the fallback, marked incomplete.
    pub async fn synthesize(&self, verdict: &AggregateVerdict, records: &[ChangeRecord]) -> Narrative {
        let eligible: Vec<&ChangeRecord> = records.iter().filter(|r| !r.is_removed()).collect();
        if eligible.is_empty() {
            return Narrative {
                summary: Self::fallback(verdict, 0),
                complete: true,
            };
        }

        match self.call(verdict, &eligible).await {
            Ok(summary) => Narrative {
                summary,
                complete: true,
            },
            Err(e) => {
                warn!(
                    entity = %verdict.entity,
                    quarter_curr = %verdict.quarter_curr,
                    error = %e,
                    "Narrative synthesis failed, using fallback summary"
                );
                Narrative {
                    summary: Self::fallback(verdict, eligible.len()),
                    complete: false,
                }
            }
        }
    }

    async fn call(&self, verdict: &AggregateVerdict, records: &[&ChangeRecord]) -> Result<String, CapabilityError> {
        let changes = records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. [{}] {} (Signal: {})\n   '{}'",
                    i + 1,
                    r.section,
                    r.description,
                    r.signal_classification,
                    r.quote_new
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let (changes, truncated) = char_prefix(&changes, SYNTHESIS_INPUT_CHARS);
        if truncated {
            debug!(entity = %verdict.entity, "Synthesis input truncated");
        }

        let payload = format!(
            "Review these detected changes in quarterly filings for {} ({} -> {}). \
             The computed overall signal is {} with score {:+.2}.\n\n{}",
            verdict.entity,
            verdict.quarter_prev,
            verdict.quarter_curr,
            verdict.overall_signal,
            verdict.overall_score,
            changes
        );

        let request = ExtractionRequest::new("disclosure-strategist", SYSTEM_PROMPT, payload);
        let response = tokio::time::timeout(self.call_timeout, self.capability.extract(request))
            .await
            .map_err(|_| CapabilityError::Timeout(self.call_timeout))??;

        let synthesis: Synthesis = decode_structured(&response.output)?;
        let summary = [synthesis.insights.trim(), synthesis.verdict.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        if summary.is_empty() {
            return Err(CapabilityError::Malformed("empty synthesis".into()));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityOutput, CapabilityResponse, Usage};
    use crate::types::{Section, SignalClassification};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::time::Duration;

    fn ctx() -> PairContext {
        PairContext::new("ACME", "Q1_2024", "Q2_2024")
    }

    fn scored(score: f64, status: ValidationStatus) -> ChangeRecord {
        ChangeRecord {
            entity: "ACME".into(),
            section: Section::MdA,
            quarter_prev: "Q1_2024".into(),
            quarter_curr: "Q2_2024".into(),
            quote_old: "old".into(),
            quote_new: "new".into(),
            description: format!("moved {score}"),
            signal_classification: if score > 0.0 {
                SignalClassification::Positive
            } else if score < 0.0 {
                SignalClassification::Negative
            } else {
                SignalClassification::Noise
            },
            signal_score: score,
            validation_status: Some(status),
            validation_note: String::new(),
            market_validation: None,
            market_note: String::new(),
        }
    }

    #[test]
    fn test_mean_of_mixed_scores() {
        let records = vec![
            scored(8.0, ValidationStatus::Verified),
            scored(-2.0, ValidationStatus::Flagged),
            scored(1.0, ValidationStatus::Verified),
        ];
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &records);
        assert_eq!(verdict.overall_score, 2.33);
        assert_eq!(verdict.overall_signal, OverallSignal::Positive);
        assert_eq!(verdict.verified_count, 2);
        assert_eq!(verdict.flagged_count, 1);
    }

    #[test]
    fn test_empty_is_noise() {
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &[]);
        assert_eq!(verdict.overall_score, 0.0);
        assert_eq!(verdict.overall_signal, OverallSignal::Noise);
    }

    #[test]
    fn test_removed_excluded_but_counted() {
        let records = vec![
            scored(-9.0, ValidationStatus::Removed),
            scored(1.0, ValidationStatus::Verified),
        ];
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &records);
        assert_eq!(verdict.overall_score, 1.0);
        assert_eq!(verdict.overall_signal, OverallSignal::Mixed);
        assert_eq!(verdict.removed_count, 1);
    }

    #[test]
    fn test_unresolved_counted() {
        let mut record = scored(3.0, ValidationStatus::Flagged);
        record.validation_note = format!("{}: quote audit unavailable (timeout)", PARTIAL_VALIDATION);
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &[record]);
        assert_eq!(verdict.unresolved_count, 1);
        assert_eq!(verdict.flagged_count, 1);
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(SignalAggregator::classify(2.0), OverallSignal::Mixed);
        assert_eq!(SignalAggregator::classify(-2.01), OverallSignal::Negative);
        assert_eq!(SignalAggregator::classify(0.5), OverallSignal::Noise);
        assert_eq!(SignalAggregator::classify(-0.51), OverallSignal::Mixed);
    }

    proptest! {
        #[test]
        fn prop_score_stays_in_bound(scores in proptest::collection::vec(-1.0e6f64..1.0e6, 0..20)) {
            let records: Vec<ChangeRecord> = scores
                .iter()
                .map(|s| scored(*s, ValidationStatus::Verified))
                .collect();
            let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &records);
            prop_assert!(verdict.overall_score.abs() <= 10.0);
            prop_assert_eq!(verdict.overall_signal, SignalAggregator::classify(verdict.overall_score));
        }
    }

    struct Writer(Result<String, CapabilityError>);

    #[async_trait]
    impl ExtractionCapability for Writer {
        async fn extract(
            &self,
            _request: ExtractionRequest,
        ) -> Result<CapabilityResponse, CapabilityError> {
            self.0.clone().map(|text| CapabilityResponse {
                output: CapabilityOutput::Text(text),
                usage: Usage::default(),
            })
        }
    }

    fn synthesizer(reply: Result<&str, CapabilityError>) -> NarrativeSynthesizer {
        NarrativeSynthesizer::new(Arc::new(Writer(reply.map(str::to_string))), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_synthesis_joins_parts() {
        let records = vec![scored(4.0, ValidationStatus::Verified)];
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &records);
        let narrative = synthesizer(Ok(r#"{"insights": "Demand recovered.", "verdict": "Outlook improving."}"#))
            .synthesize(&verdict, &records)
            .await;
        assert_eq!(narrative.summary, "Demand recovered.\n\nOutlook improving.");
        assert!(narrative.complete);
    }

    #[tokio::test]
    async fn test_synthesis_failure_falls_back() {
        let records = vec![scored(4.0, ValidationStatus::Verified)];
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &records);
        let narrative = synthesizer(Err(CapabilityError::RateLimited))
            .synthesize(&verdict, &records)
            .await;
        assert!(narrative.summary.starts_with("Positive signal (+4.00) for ACME"));
        assert!(!narrative.complete);
    }

    #[tokio::test]
    async fn test_no_changes_summary() {
        let verdict = SignalAggregator::new(10.0).aggregate(&ctx(), &[]);
        let narrative = synthesizer(Ok("{}")).synthesize(&verdict, &[]).await;
        assert_eq!(
            narrative.summary,
            "No significant changes detected between Q1_2024 and Q2_2024 for ACME."
        );
        assert!(narrative.complete);
    }
}
