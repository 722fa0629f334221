//! Deterministic numeric-trend detection over stored facts.
//!
//! Facts are grouped by (entity, metric), ordered by period, and each
//! adjacent pair of periods is compared. A fall of 5% or more is a Drift,
//! a rise of 20% or more is a Spike.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::facts::Fact;
use crate::ordering::{ChronologicalOrdering, PeriodOrdering};

/// Changes at or below this percentage are a Drift.
pub const DRIFT_THRESHOLD_PCT: f64 = -5.0;

/// Changes at or above this percentage are a Spike.
pub const SPIKE_THRESHOLD_PCT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    Spike,
    Drift,
}

/// One significant period-over-period move of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub entity: String,
    pub metric: String,
    pub period_from: String,
    pub period_to: String,
    pub value_from: f64,
    pub value_to: f64,
    pub pct_change: f64,
    pub kind: AnomalyKind,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, verb) = match self.kind {
            AnomalyKind::Drift => ("NEGATIVE DRIFT", "declined"),
            AnomalyKind::Spike => ("SPIKE", "jumped"),
        };
        write!(
            f,
            "{}: {} {} {} {:.1}% from {} to {} (Value: {} vs {})",
            label,
            self.entity,
            self.metric,
            verb,
            self.pct_change,
            self.period_from,
            self.period_to,
            self.value_to,
            self.value_from
        )
    }
}

/// Normalize a raw fact value: strip `$`, `,`, `%` and parse.
///
/// Returns `None` for anything that is not a plain number afterwards.
pub fn parse_value(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%'))
        .collect();
    cleaned.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Pure detector over fact lists.
#[derive(Clone)]
pub struct AnomalyDetector {
    ordering: Arc<dyn PeriodOrdering>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(Arc::new(ChronologicalOrdering))
    }
}

impl AnomalyDetector {
    pub fn new(ordering: Arc<dyn PeriodOrdering>) -> Self {
        Self { ordering }
    }

    /// Human-readable anomaly descriptions.
    pub fn detect(&self, facts: &[Fact]) -> Vec<String> {
        self.detect_structured(facts)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Structured anomalies, grouped by (entity, metric) in sorted order.
    pub fn detect_structured(&self, facts: &[Fact]) -> Vec<Anomaly> {
        // (entity, metric) → period → raw value; a later fact for the same period wins.
        let mut history: BTreeMap<(&str, &str), BTreeMap<&str, &str>> = BTreeMap::new();
        for fact in facts {
            history
                .entry((fact.entity.as_str(), fact.metric.as_str()))
                .or_default()
                .insert(fact.period.as_str(), fact.value.as_str());
        }

        let mut anomalies = Vec::new();

        for ((entity, metric), periods) in history {
            let mut labels: Vec<String> = periods.keys().map(|p| p.to_string()).collect();
            self.ordering.sort(&mut labels);

            for window in labels.windows(2) {
                let (from, to) = (&window[0], &window[1]);
                let (Some(prev), Some(curr)) = (
                    periods.get(from.as_str()).and_then(|v| parse_value(v)),
                    periods.get(to.as_str()).and_then(|v| parse_value(v)),
                ) else {
                    continue;
                };
                if prev == 0.0 {
                    continue;
                }

                let pct_change = (curr - prev) * 100.0 / prev;
                let kind = if pct_change <= DRIFT_THRESHOLD_PCT {
                    AnomalyKind::Drift
                } else if pct_change >= SPIKE_THRESHOLD_PCT {
                    AnomalyKind::Spike
                } else {
                    continue;
                };

                anomalies.push(Anomaly {
                    entity: entity.to_string(),
                    metric: metric.to_string(),
                    period_from: from.clone(),
                    period_to: to.clone(),
                    value_from: prev,
                    value_to: curr,
                    pct_change,
                    kind,
                });
            }
        }

        anomalies
    }
}
