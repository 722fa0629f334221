//! Cross validation of change records.
//!
//! Every record goes through three checks:
//!
//! - **Quote audit**: a secondary capability call compares quotes and
//!   claims with the raw source texts, tolerating paraphrase, and may supply
//!   corrected verbatim quotes.
//! - **Numeric accuracy**: every number in a quote or description must occur
//!   in the source text. Local, no capability involved.
//! - **Signal consistency**: the score's sign must agree with the
//!   classification, and the claim must not contradict a detected anomaly.
//!   Local, no capability involved.
//!
//! The local checks always run. When the audit call fails, affected records
//! are Flagged with a `partial validation:` note instead of being Verified.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use disclosure_common::util::char_prefix;

use crate::anomaly::{Anomaly, AnomalyKind};
use crate::capability::{decode_structured, CapabilityError, ExtractionCapability, ExtractionRequest};
use crate::regime::RegimePolicy;
use crate::settings::PipelineSettings;
use crate::types::{ChangeRecord, SignalClassification, ValidationStatus};

const AGENT: &str = "disclosure-judge";

/// Prefix of the note carried by records whose quote audit never completed.
pub const PARTIAL_VALIDATION: &str = "partial validation";

const SYSTEM_PROMPT: &str = r#"You audit claims extracted from company filings against the filings themselves.

For every numbered claim decide:
- Verified: both quotes appear in their source (verbatim or a very close paraphrase) and every number matches exactly.
- Flagged: a quote is paraphrased beyond recognition, a number differs slightly, or the description overstates the quotes.
- Removed: a quote or number has no basis in the source at all.

When a quote is a paraphrase, give the verbatim source sentence in corrected_quote_old / corrected_quote_new.
Output only JSON: {"results": [{"index": 1, "status": "Verified|Flagged|Removed", "reason": "...", "corrected_quote_old": "", "corrected_quote_new": ""}]}"#;

// No trailing boundary: figures are often written against their unit ("9bn", "12bps").
static NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d[\d,]*(?:\.\d+)?").unwrap());

#[derive(Debug, Default, Deserialize)]
struct AuditReply {
    #[serde(default)]
    results: Vec<AuditResult>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditResult {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    corrected_quote_old: Option<String>,
    #[serde(default)]
    corrected_quote_new: Option<String>,
}

/// Validated records plus what went wrong along the way.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub records: Vec<ChangeRecord>,
    /// Set when the quote audit call failed
    pub capability_error: Option<CapabilityError>,
    /// Records whose quote audit never completed
    pub unresolved: usize,
}

/// One check's verdict on a record.
struct Finding {
    status: ValidationStatus,
    note: String,
}

impl Finding {
    fn flagged(note: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Flagged,
            note: note.into(),
        }
    }

    fn removed(note: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Removed,
            note: note.into(),
        }
    }
}

/// Numbers occurring in `text`, as values.
fn numbers_in(text: &str) -> Vec<f64> {
    NUMBER_PATTERN
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

fn missing_numbers<'a>(claim: &'a str, source: &[f64]) -> Vec<&'a str> {
    NUMBER_PATTERN
        .find_iter(claim)
        .filter(|m| {
            m.as_str()
                .replace(',', "")
                .parse::<f64>()
                .map(|v| !source.iter().any(|s| (s - v).abs() < 1e-9))
                .unwrap_or(false)
        })
        .map(|m| m.as_str())
        .collect()
}

/// Audits change records against their source texts.
#[derive(Clone)]
pub struct CrossValidator {
    capability: Arc<dyn ExtractionCapability>,
    policy: Arc<dyn RegimePolicy>,
    settings: Arc<PipelineSettings>,
}

impl CrossValidator {
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

    /// Validate records, returning them status-annotated.
    pub async fn validate(
        &self,
        records: Vec<ChangeRecord>,
        source_text_prev: &str,
        source_text_curr: &str,
        known_anomalies: &[Anomaly],
    ) -> Vec<ChangeRecord> {
        self.validate_detailed(records, source_text_prev, source_text_curr, known_anomalies)
            .await
            .records
    }

    /// Validate records, also reporting audit failures.
    pub async fn validate_detailed(
        &self,
        records: Vec<ChangeRecord>,
        source_text_prev: &str,
        source_text_curr: &str,
        known_anomalies: &[Anomaly],
    ) -> ValidationOutcome {
        if records.is_empty() {
            return ValidationOutcome::default();
        }

        let audit = self.audit(&records, source_text_prev, source_text_curr).await;
        let (results, capability_error) = match audit {
            Ok(reply) => {
                let mut by_index = HashMap::new();
                for (position, result) in reply.results.into_iter().enumerate() {
                    by_index.insert(result.index.unwrap_or(position + 1), result);
                }
                (Some(by_index), None)
            }
            Err(e) => {
                warn!(
                    entity = %records[0].entity,
                    section = %records[0].section,
                    error = %e,
                    "Quote audit failed, falling back to local checks"
                );
                (None, Some(e))
            }
        };

        let prev_numbers = numbers_in(source_text_prev);
        let curr_numbers = numbers_in(source_text_curr);
        let both_numbers: Vec<f64> = prev_numbers.iter().chain(&curr_numbers).copied().collect();

        let mut unresolved = 0;
        let mut validated = Vec::with_capacity(records.len());

        for (position, mut record) in records.into_iter().enumerate() {
            let mut findings = Vec::new();

            let result = results.as_ref().and_then(|r| r.get(&(position + 1)));
            if let Some(finding) = self.apply_audit(&mut record, result, capability_error.as_ref()) {
                if finding.note.starts_with(PARTIAL_VALIDATION) {
                    unresolved += 1;
                }
                findings.push(finding);
            }

            findings.extend(self.check_numbers(&record, &prev_numbers, &curr_numbers, &both_numbers));
            findings.extend(self.check_sign(&mut record));
            findings.extend(self.check_anomalies(&record, known_anomalies));

            let status = findings
                .iter()
                .map(|f| f.status)
                .max()
                .unwrap_or(ValidationStatus::Verified);
            let note = if status == ValidationStatus::Verified {
                String::new()
            } else {
                findings
                    .iter()
                    .filter(|f| f.status != ValidationStatus::Verified && !f.note.is_empty())
                    .map(|f| f.note.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            };

            if status != ValidationStatus::Verified {
                warn!(
                    entity = %record.entity,
                    section = %record.section,
                    quarter_curr = %record.quarter_curr,
                    status = %status,
                    note = %note,
                    "Record did not verify"
                );
            }

            record.validation_status = Some(status);
            record.validation_note = note;
            validated.push(record);
        }

        ValidationOutcome {
            records: validated,
            capability_error,
            unresolved,
        }
    }

    async fn audit(
        &self,
        records: &[ChangeRecord],
        source_text_prev: &str,
        source_text_curr: &str,
    ) -> Result<AuditReply, CapabilityError> {
        let limit = self.settings.validation_context_chars;
        let (prev, _) = char_prefix(source_text_prev, limit);
        let (curr, _) = char_prefix(source_text_curr, limit);

        let claims = records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. [{}] {} (signal: {}, score: {})\n   OLD: \"{}\"\n   NEW: \"{}\"",
                    i + 1,
                    r.section,
                    r.description,
                    r.signal_classification,
                    r.signal_score,
                    r.quote_old,
                    r.quote_new
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let payload = format!(
            "CLAIMS:\n{claims}\n\nPREVIOUS SOURCE ({prev_q}):\n{prev}\n\nCURRENT SOURCE ({curr_q}):\n{curr}",
            claims = claims,
            prev_q = records[0].quarter_prev,
            curr_q = records[0].quarter_curr,
            prev = prev,
            curr = curr,
        );

        let request = ExtractionRequest::new(AGENT, SYSTEM_PROMPT, payload);
        let response = tokio::time::timeout(self.settings.call_timeout, self.capability.extract(request))
            .await
            .map_err(|_| CapabilityError::Timeout(self.settings.call_timeout))??;

        decode_structured(&response.output)
    }

    /// Fold the audit verdict into the record, applying quote corrections.
    fn apply_audit(
        &self,
        record: &mut ChangeRecord,
        result: Option<&AuditResult>,
        failure: Option<&CapabilityError>,
    ) -> Option<Finding> {
        let Some(result) = result else {
            let reason = match failure {
                Some(e) => e.to_string(),
                None => "no audit result for this record".to_string(),
            };
            return Some(Finding::flagged(format!(
                "{}: quote audit unavailable ({})",
                PARTIAL_VALIDATION, reason
            )));
        };

        let Some(status) = result.status.as_deref().and_then(ValidationStatus::parse_lenient) else {
            return Some(Finding::flagged(format!(
                "{}: unrecognised audit status {:?}",
                PARTIAL_VALIDATION,
                result.status.as_deref().unwrap_or("")
            )));
        };

        let mut notes = Vec::new();
        if status != ValidationStatus::Removed {
            if let Some(note) = self.apply_corrections(record, result) {
                notes.push(note);
            }
        }

        if status != ValidationStatus::Verified {
            let reason = result
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("rejected by quote audit");
            notes.insert(0, reason.to_string());
        }

        Some(Finding {
            status,
            note: notes.join("; "),
        })
    }

    /// Replace paraphrased quotes with corrected verbatim text, provided the
    /// corrected pair still shares a regime.
    fn apply_corrections(&self, record: &mut ChangeRecord, result: &AuditResult) -> Option<String> {
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let new_old = non_empty(&result.corrected_quote_old);
        let new_new = non_empty(&result.corrected_quote_new);
        if new_old.is_none() && new_new.is_none() {
            return None;
        }

        let quote_old = new_old.unwrap_or_else(|| record.quote_old.clone());
        let quote_new = new_new.unwrap_or_else(|| record.quote_new.clone());
        if quote_old == record.quote_old && quote_new == record.quote_new {
            return None;
        }

        if !self.policy.is_comparable(&quote_old, &quote_new) {
            debug!(entity = %record.entity, "Ignoring cross-regime quote correction");
            return None;
        }

        record.quote_old = quote_old;
        record.quote_new = quote_new;
        let (signal, score) =
            self.policy
                .downgrade(record.signal_classification, record.signal_score, &record.quote_new);
        record.signal_classification = signal;
        record.signal_score = score;

        Some("quotes replaced with verbatim source text".to_string())
    }

    fn check_numbers(
        &self,
        record: &ChangeRecord,
        prev_numbers: &[f64],
        curr_numbers: &[f64],
        both_numbers: &[f64],
    ) -> Option<Finding> {
        let mut missing: Vec<&str> = Vec::new();
        missing.extend(missing_numbers(&record.quote_old, prev_numbers));
        missing.extend(missing_numbers(&record.quote_new, curr_numbers));
        missing.extend(missing_numbers(&record.description, both_numbers));
        missing.dedup();

        if missing.is_empty() {
            return None;
        }

        // A number in neither filing has no source basis at all.
        let unfounded: Vec<&str> = missing
            .iter()
            .copied()
            .filter(|n| !missing_numbers(n, both_numbers).is_empty())
            .collect();
        if unfounded.is_empty() {
            Some(Finding::flagged(format!(
                "numbers not found in source: {}",
                missing.join(", ")
            )))
        } else {
            Some(Finding::removed(format!(
                "numbers not found in either filing: {}",
                unfounded.join(", ")
            )))
        }
    }

    /// Sign/classification agreement. A mismatch is flagged and the record
    /// is down-classified to Noise.
    fn check_sign(&self, record: &mut ChangeRecord) -> Option<Finding> {
        let threshold = self.settings.noise_threshold;
        if record
            .signal_classification
            .agrees_with(record.signal_score, threshold)
        {
            return None;
        }

        let note = format!(
            "signal/score mismatch: {} with score {}",
            record.signal_classification, record.signal_score
        );
        record.signal_classification = SignalClassification::Noise;
        record.signal_score = 0.0;
        Some(Finding::flagged(note))
    }

    /// Claims that run against a detected numeric anomaly for a metric the
    /// record mentions.
    fn check_anomalies(&self, record: &ChangeRecord, anomalies: &[Anomaly]) -> Option<Finding> {
        let entity = record.entity.to_lowercase();
        let claim = format!("{} {}", record.quote_new, record.description).to_lowercase();

        let contradictions: Vec<String> = anomalies
            .iter()
            .filter(|a| a.entity.to_lowercase() == entity)
            .filter(|a| !a.metric.is_empty() && claim.contains(&a.metric.to_lowercase()))
            .filter(|a| {
                matches!(
                    (record.signal_classification, a.kind),
                    (SignalClassification::Positive, AnomalyKind::Drift)
                        | (SignalClassification::Negative, AnomalyKind::Spike)
                )
            })
            .map(|a| {
                format!(
                    "contradicts {:?} in {} ({} to {}, {:+.1}%)",
                    a.kind, a.metric, a.period_from, a.period_to, a.pct_change
                )
            })
            .collect();

        if contradictions.is_empty() {
            None
        } else {
            Some(Finding::flagged(contradictions.join("; ")))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
