//! Final run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use disclosure_common::util::truncate_with_ellipsis;

use crate::anomaly::Anomaly;
use crate::capability::Usage;
use crate::types::{AggregateVerdict, ChangeRecord, Section, ValidationStatus};

/// Quotes longer than this are shortened in the markdown summary.
const QUOTE_PREVIEW_CHARS: usize = 120;

/// Everything produced for one (entity, quarter pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReport {
    pub entity: String,
    pub quarter_prev: String,
    pub quarter_curr: String,
    /// Records were reused from the cache
    pub from_cache: bool,
    pub records: Vec<ChangeRecord>,
    pub verdict: AggregateVerdict,
    /// Verified share of all records, in percent
    pub validation_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_alignment_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub market_sources: Vec<String>,
}

/// Verified / total × 100, or 100 when there is nothing to validate.
pub fn validation_score(records: &[ChangeRecord]) -> f64 {
    if records.is_empty() {
        return 100.0;
    }
    let verified = records
        .iter()
        .filter(|r| r.validation_status == Some(ValidationStatus::Verified))
        .count();
    (verified as f64 * 1000.0 / records.len() as f64).round() / 10.0
}

/// Something the run did not process, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarter_prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarter_curr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<Section>,
    pub reason: String,
}

/// Run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub pairs_total: usize,
    pub cache_hits: usize,
    pub units_run: usize,
    pub capability_failures: usize,
    pub records_before_dedup: usize,
    pub records_after_dedup: usize,
    pub usage: Usage,
}

/// Output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub pairs: Vec<PairReport>,
    /// Numeric anomalies of the entities in the run
    pub anomalies: Vec<Anomaly>,
    pub skipped: Vec<SkipEntry>,
    pub stats: RunStats,
}

impl Report {
    /// Verdict of one pair, if it was processed.
    pub fn verdict(&self, entity: &str, quarter_prev: &str, quarter_curr: &str) -> Option<&AggregateVerdict> {
        self.pairs
            .iter()
            .find(|p| p.entity == entity && p.quarter_prev == quarter_prev && p.quarter_curr == quarter_curr)
            .map(|p| &p.verdict)
    }

    /// Human-readable summary.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Disclosure Delta Report\n");
        let _ = writeln!(
            md,
            "Run `{}` generated {}\n",
            self.run_id,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let _ = writeln!(md, "## Verdicts\n");
        if self.pairs.is_empty() {
            let _ = writeln!(md, "*No quarter pairs were compared.*\n");
        } else {
            let _ = writeln!(
                md,
                "| Entity | Period | Signal | Score | Verified | Flagged | Removed | Validation | Cached |"
            );
            let _ = writeln!(md, "|---|---|---|---|---|---|---|---|---|");
            for pair in &self.pairs {
                let v = &pair.verdict;
                let _ = writeln!(
                    md,
                    "| {} | {} → {} | {} | {:+.2} | {} | {} | {} | {:.1}% | {} |",
                    pair.entity,
                    pair.quarter_prev,
                    pair.quarter_curr,
                    v.overall_signal,
                    v.overall_score,
                    v.verified_count,
                    v.flagged_count,
                    v.removed_count,
                    pair.validation_score,
                    if pair.from_cache { "yes" } else { "no" }
                );
            }
            md.push('\n');

            for pair in &self.pairs {
                let _ = writeln!(
                    md,
                    "### {} {} → {}\n\n{}\n",
                    pair.entity, pair.quarter_prev, pair.quarter_curr, pair.verdict.summary
                );
                if let Some(pct) = pair.market_alignment_pct {
                    let _ = writeln!(md, "Market alignment: {:.1}% ({} sources)\n", pct, pair.market_sources.len());
                }

                let issues: Vec<&ChangeRecord> = pair
                    .records
                    .iter()
                    .filter(|r| r.effective_status() != ValidationStatus::Verified)
                    .collect();
                if !issues.is_empty() {
                    let _ = writeln!(md, "Validation issues:\n");
                    for r in issues {
                        let _ = writeln!(
                            md,
                            "- **{}** [{}] {}: {}",
                            r.effective_status(),
                            r.section,
                            r.description,
                            r.validation_note
                        );
                        let _ = writeln!(
                            md,
                            "  > {}",
                            truncate_with_ellipsis(&r.quote_new, QUOTE_PREVIEW_CHARS)
                        );
                    }
                    md.push('\n');
                }
            }
        }

        if !self.anomalies.is_empty() {
            let _ = writeln!(md, "## Numeric Anomalies\n");
            for anomaly in &self.anomalies {
                let _ = writeln!(md, "- {}", anomaly);
            }
            md.push('\n');
        }

        if !self.skipped.is_empty() {
            let _ = writeln!(md, "## Skipped\n");
            for skip in &self.skipped {
                let scope = [
                    skip.quarter_prev.as_deref(),
                    skip.quarter_curr.as_deref(),
                    skip.section.map(|s| s.as_str()),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" / ");
                if scope.is_empty() {
                    let _ = writeln!(md, "- {}: {}", skip.entity, skip.reason);
                } else {
                    let _ = writeln!(md, "- {} ({}): {}", skip.entity, scope, skip.reason);
                }
            }
            md.push('\n');
        }

        let s = &self.stats;
        let _ = writeln!(md, "## Run Statistics\n");
        let _ = writeln!(md, "- Pairs: {} ({} from cache, {} computed)", s.pairs_total, s.cache_hits, s.units_run);
        let _ = writeln!(md, "- Capability failures: {}", s.capability_failures);
        let _ = writeln!(
            md,
            "- Records: {} before dedup, {} after",
            s.records_before_dedup, s.records_after_dedup
        );
        let _ = writeln!(
            md,
            "- Tokens: {} in, {} out",
            s.usage.input_tokens, s.usage.output_tokens
        );

        md
    }
}
