//! Section comparison.
//!
//! Asks the extraction capability for the meaningful changes between two
//! versions of one section and turns its answer into regime-gated,
//! deduplicated change records.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use disclosure_common::util::{char_len, char_prefix, normalize_for_match};

use crate::capability::{decode_structured, CapabilityError, ExtractionCapability, ExtractionRequest};
use crate::regime::RegimePolicy;
use crate::settings::PipelineSettings;
use crate::types::{ChangeRecord, PairContext, Section, SignalClassification};

const AGENT: &str = "disclosure-delta";

const SYSTEM_PROMPT: &str = r#"You compare two versions of one section of a company's periodic filing and report the meaningful changes.

Rules:
1. Ignore boilerplate, formatting and repeated tables.
2. Report shifts in tone (e.g. "temporary" becoming "structural").
3. Report new specificity (vague wording replaced by quantified or named drivers).
4. Report accounting policy or methodology changes.
5. Only pair an old and a new quote that talk about the same kind of concept; never compare operating commentary with accounting methodology.

Signals:
- Positive: structural improvement or durable risk reduction.
- Negative: structural deterioration or newly revealed risk.
- Noise: one-time, compliance-driven or purely explanatory change.

Output only JSON. Report between 0 and {max} changes. Quotes must be verbatim and under 100 words. signal_score is in [-10, 10] and its sign must match the signal."#;

/// Why a section produced no records.
#[derive(Debug, Clone, Error)]
pub enum SectionSkip {
    #[error("section text too short (previous {prev_len}, current {curr_len}, minimum {min} chars)")]
    InsufficientText {
        prev_len: usize,
        curr_len: usize,
        min: usize,
    },

    #[error("extraction failed: {0}")]
    CapabilityFailed(CapabilityError),
}

impl SectionSkip {
    pub fn is_capability_failure(&self) -> bool {
        matches!(self, Self::CapabilityFailed(_))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawChanges {
    #[serde(default)]
    changes: Vec<RawChange>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChange {
    #[serde(default)]
    quote_old: Option<String>,
    #[serde(default)]
    quote_new: Option<String>,
    #[serde(default, alias = "description_of_change")]
    description: Option<String>,
    #[serde(default)]
    signal_classification: Option<String>,
    #[serde(default)]
    signal_score: Option<serde_json::Value>,
}

impl RawChange {
    fn score(&self) -> Option<f64> {
        let value = self.signal_score.as_ref()?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|v: &f64| v.is_finite())
    }
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "changes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "quote_old": {"type": "string"},
                        "quote_new": {"type": "string"},
                        "description": {"type": "string"},
                        "signal_classification": {"enum": ["Positive", "Negative", "Noise"]},
                        "signal_score": {"type": "number"}
                    },
                    "required": ["quote_old", "quote_new", "description", "signal_classification"]
                }
            }
        },
        "required": ["changes"]
    })
}

/// Score used when the capability gives a label but no number.
fn default_score(signal: SignalClassification) -> f64 {
    match signal {
        SignalClassification::Positive => 1.0,
        SignalClassification::Negative => -1.0,
        SignalClassification::Noise => 0.0,
    }
}

/// Compares one section across two periods.
#[derive(Clone)]
pub struct SectionComparator {
    capability: Arc<dyn ExtractionCapability>,
    policy: Arc<dyn RegimePolicy>,
    settings: Arc<PipelineSettings>,
}

impl SectionComparator {
    pub fn new(
        capability: Arc<dyn ExtractionCapability>,
        policy: Arc<dyn RegimePolicy>,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        Self {
            capability,
            policy,
            settings,
        }
    }

    /// Compare a section, folding every failure into an empty list.
    pub async fn compare(
        &self,
        ctx: &PairContext,
        section: Section,
        text_prev: &str,
        text_curr: &str,
    ) -> Vec<ChangeRecord> {
        self.try_compare(ctx, section, text_prev, text_curr)
            .await
            .unwrap_or_default()
    }

    /// Compare a section, reporting why nothing was produced.
    pub async fn try_compare(
        &self,
        ctx: &PairContext,
        section: Section,
        text_prev: &str,
        text_curr: &str,
    ) -> Result<Vec<ChangeRecord>, SectionSkip> {
        let min = self.settings.min_section_length;
        let (prev_len, curr_len) = (char_len(text_prev.trim()), char_len(text_curr.trim()));
        if prev_len < min || curr_len < min {
            info!(
                entity = %ctx.entity,
                section = %section,
                prev_len,
                curr_len,
                "Skipping section below minimum length"
            );
            return Err(SectionSkip::InsufficientText {
                prev_len,
                curr_len,
                min,
            });
        }

        let request = self.build_request(ctx, section, text_prev, text_curr);

        let response = match tokio::time::timeout(
            self.settings.call_timeout,
            self.capability.extract(request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.failed(ctx, section, e)),
            Err(_) => {
                return Err(self.failed(
                    ctx,
                    section,
                    CapabilityError::Timeout(self.settings.call_timeout),
                ))
            }
        };

        let raw: RawChanges = decode_structured(&response.output)
            .map_err(|e| self.failed(ctx, section, e))?;

        if raw.changes.len() > self.settings.max_changes_per_section {
            warn!(
                entity = %ctx.entity,
                section = %section,
                returned = raw.changes.len(),
                limit = self.settings.max_changes_per_section,
                "Capability returned more changes than requested"
            );
        }

        Ok(self.accept(ctx, section, raw.changes))
    }

    fn failed(&self, ctx: &PairContext, section: Section, error: CapabilityError) -> SectionSkip {
        warn!(
            entity = %ctx.entity,
            section = %section,
            quarter_prev = %ctx.quarter_prev,
            quarter_curr = %ctx.quarter_curr,
            error = %error,
            "Section comparison failed"
        );
        SectionSkip::CapabilityFailed(error)
    }

    fn build_request(
        &self,
        ctx: &PairContext,
        section: Section,
        text_prev: &str,
        text_curr: &str,
    ) -> ExtractionRequest {
        let limit = self.settings.max_section_chars;
        let (prev, prev_cut) = char_prefix(text_prev, limit);
        let (curr, curr_cut) = char_prefix(text_curr, limit);
        if prev_cut || curr_cut {
            debug!(
                entity = %ctx.entity,
                section = %section,
                limit,
                prev_cut,
                curr_cut,
                "Truncated section text"
            );
        }

        let system = SYSTEM_PROMPT.replace("{max}", &self.settings.max_changes_per_section.to_string());
        let payload = format!(
            "Compare these two versions of the {section} section of {entity} ({prev_q} -> {curr_q}).\n\n\
             PREVIOUS:\n{prev}\n\nCURRENT:\n{curr}\n\n\
             Return JSON: {{\"changes\": [{{\"quote_old\": \"...\", \"quote_new\": \"...\", \
             \"description\": \"...\", \"signal_classification\": \"Positive|Negative|Noise\", \
             \"signal_score\": 0.0}}]}}",
            section = section,
            entity = ctx.entity,
            prev_q = ctx.quarter_prev,
            curr_q = ctx.quarter_curr,
            prev = prev,
            curr = curr,
        );

        ExtractionRequest::new(AGENT, system, payload).with_schema(response_schema())
    }

    /// Apply the quote, regime and duplicate gates to raw candidates.
    fn accept(&self, ctx: &PairContext, section: Section, candidates: Vec<RawChange>) -> Vec<ChangeRecord> {
        let bound = self.settings.score_bound;
        let mut seen_new = HashSet::new();
        let mut seen_desc = HashSet::new();
        let mut accepted = Vec::new();

        for candidate in candidates {
            let quote_old = candidate.quote_old.as_deref().unwrap_or("").trim().to_string();
            let quote_new = candidate.quote_new.as_deref().unwrap_or("").trim().to_string();
            let description = candidate.description.as_deref().unwrap_or("").trim().to_string();

            if quote_old.is_empty() || quote_new.is_empty() {
                debug!(section = %section, "Dropping candidate with empty quote");
                continue;
            }

            if !self.policy.is_comparable(&quote_old, &quote_new) {
                debug!(
                    section = %section,
                    old = %self.policy.classify(&quote_old),
                    new = %self.policy.classify(&quote_new),
                    "Dropping cross-regime candidate"
                );
                continue;
            }

            let new_key = normalize_for_match(&quote_new);
            let desc_key = normalize_for_match(&description);
            if seen_new.contains(&new_key) || seen_desc.contains(&desc_key) {
                debug!(section = %section, "Dropping duplicate candidate");
                continue;
            }

            let signal = candidate
                .signal_classification
                .as_deref()
                .map(SignalClassification::parse_lenient)
                .unwrap_or(SignalClassification::Noise);
            let score = candidate
                .score()
                .unwrap_or_else(|| default_score(signal))
                .clamp(-bound, bound);
            let (signal, score) = self.policy.downgrade(signal, score, &quote_new);

            seen_new.insert(new_key);
            seen_desc.insert(desc_key);

            accepted.push(ChangeRecord {
                entity: ctx.entity.clone(),
                section,
                quarter_prev: ctx.quarter_prev.clone(),
                quarter_curr: ctx.quarter_curr.clone(),
                quote_old,
                quote_new,
                description,
                signal_classification: signal,
                signal_score: score,
                validation_status: None,
                validation_note: String::new(),
                market_validation: None,
                market_note: String::new(),
            });
        }

        accepted
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityOutput, CapabilityResponse, Usage};
    use crate::regime::KeywordRegimeClassifier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Scripted {
        reply: Result<String, CapabilityError>,
        calls: AtomicU32,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicU32::new(0),
                delay: None,
            })
        }

        fn err(error: CapabilityError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(error),
                calls: AtomicU32::new(0),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl ExtractionCapability for Scripted {
        async fn extract(
            &self,
            _request: ExtractionRequest,
        ) -> Result<CapabilityResponse, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply.clone().map(|text| CapabilityResponse {
                output: CapabilityOutput::Text(text),
                usage: Usage::default(),
            })
        }
    }

    fn comparator(capability: Arc<Scripted>) -> SectionComparator {
        SectionComparator::new(
            capability,
            Arc::new(KeywordRegimeClassifier::default()),
            Arc::new(PipelineSettings::default()),
        )
    }

    fn ctx() -> PairContext {
        PairContext::new("ACME", "Q1_2024", "Q2_2024")
    }

    fn long(text: &str) -> String {
        format!("{} {}", text, "Filler sentence about the business. ".repeat(5))
    }

    #[tokio::test]
    async fn test_short_text_skips_capability() {
        let capability = Scripted::ok(r#"{"changes": []}"#);
        let comparator = comparator(capability.clone());

        let short = "x".repeat(40);
        let result = comparator
            .try_compare(&ctx(), Section::MdA, &short, &long("current"))
            .await;

        assert!(matches!(result, Err(SectionSkip::InsufficientText { prev_len: 40, .. })));
        assert_eq!(capability.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gates_applied_in_order() {
        let reply = r#"Sure, here you go:
```json
{"changes": [
  {"quote_old": "Demand was soft", "quote_new": "Demand recovered strongly", "description_of_change": "Demand turned", "signal_classification": "Positive", "signal_score": 4},
  {"quote_old": "", "quote_new": "Something new", "description": "empty old", "signal_classification": "Negative"},
  {"quote_old": "Volumes fell", "quote_new": "We revised the impairment methodology", "description": "cross regime", "signal_classification": "Negative"},
  {"quote_old": "Demand was weak", "quote_new": "demand recovered strongly", "description": "dup quote", "signal_classification": "Positive"},
  {"quote_old": "A one-time charge hit costs", "quote_new": "An exceptional gain lifted results", "description": "one-off", "signal_classification": "Positive", "signal_score": 7},
  {"quote_old": "Churn was low", "quote_new": "Churn rose sharply", "description": "churn", "signal_classification": "sideways"}
]}
```"#;
        let comparator = comparator(Scripted::ok(reply));
        let records = comparator
            .compare(&ctx(), Section::MdA, &long("previous"), &long("current"))
            .await;

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].description, "Demand turned");
        assert_eq!(records[0].signal_score, 4.0);
        assert_eq!(records[1].signal_classification, SignalClassification::Noise);
        assert_eq!(records[1].signal_score, 0.0);
        assert_eq!(records[2].signal_classification, SignalClassification::Noise);
        assert!(records.iter().all(|r| r.validation_status.is_none()));
    }

    #[tokio::test]
    async fn test_duplicates_ignore_whitespace_and_case() {
        let reply = r#"{"changes": [
          {"quote_old": "Demand was soft", "quote_new": "Demand recovered strongly", "description": "Demand turned", "signal_classification": "Positive", "signal_score": 3},
          {"quote_old": "Orders were soft", "quote_new": "Orders picked up", "description": "demand   TURNED", "signal_classification": "Positive", "signal_score": 2},
          {"quote_old": "Demand was weak", "quote_new": "Demand  recovered\nstrongly", "description": "other", "signal_classification": "Positive", "signal_score": 2}
        ]}"#;
        let records = comparator(Scripted::ok(reply))
            .compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].quote_new, "Demand recovered strongly");
    }

    #[tokio::test]
    async fn test_missing_score_defaults_and_clamps() {
        let reply = r#"{"changes": [
          {"quote_old": "Margins were thin", "quote_new": "Margins widened", "description": "a", "signal_classification": "Negative"},
          {"quote_old": "Pipeline was thin", "quote_new": "Pipeline is full", "description": "b", "signal_classification": "Positive", "signal_score": "42"}
        ]}"#;
        let records = comparator(Scripted::ok(reply))
            .compare(&ctx(), Section::RiskFactors, &long("p"), &long("c"))
            .await;

        assert_eq!(records[0].signal_score, -1.0);
        assert_eq!(records[1].signal_score, 10.0);
    }

    #[tokio::test]
    async fn test_capability_error_is_skip() {
        let comparator = comparator(Scripted::err(CapabilityError::RateLimited));
        let result = comparator
            .try_compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await;
        assert!(matches!(result, Err(ref s) if s.is_capability_failure()));
        assert!(comparator
            .compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_output_is_skip() {
        let comparator = comparator(Scripted::ok("No notable changes this time."));
        let result = comparator
            .try_compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await;
        assert!(matches!(
            result,
            Err(SectionSkip::CapabilityFailed(CapabilityError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_skip() {
        let capability = Arc::new(Scripted {
            reply: Ok(r#"{"changes": []}"#.into()),
            calls: AtomicU32::new(0),
            delay: Some(Duration::from_millis(200)),
        });
        let comparator = SectionComparator::new(
            capability,
            Arc::new(KeywordRegimeClassifier::default()),
            Arc::new(PipelineSettings::default().with_call_timeout(Duration::from_millis(20))),
        );

        let result = comparator
            .try_compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await;
        assert!(matches!(
            result,
            Err(SectionSkip::CapabilityFailed(CapabilityError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_non_compliant_count_is_tolerated() {
        let changes: Vec<String> = (0..7)
            .map(|i| {
                format!(
                    r#"{{"quote_old": "Old line {i}", "quote_new": "New line {i}", "description": "d{i}", "signal_classification": "Positive", "signal_score": 1}}"#
                )
            })
            .collect();
        let reply = format!(r#"{{"changes": [{}]}}"#, changes.join(","));
        let records = comparator(Scripted::ok(&reply))
            .compare(&ctx(), Section::MdA, &long("p"), &long("c"))
            .await;
        assert_eq!(records.len(), 7);
    }
}
