//! Regime classification.
//!
//! A regime is a coarse category of a text snippet. Two quotes only form a
//! valid change when they share a regime, and a new quote describing a
//! one-time event never carries a directional signal.

use aho_corasick::{AhoCorasick, BuildError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::types::SignalClassification;

/// Coarse category of a text snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Accounting,
    OneTime,
    Guidance,
    Operating,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::Accounting => "Accounting",
            Regime::OneTime => "OneTime",
            Regime::Guidance => "Guidance",
            Regime::Operating => "Operating",
        };
        f.write_str(s)
    }
}

/// Swappable comparability policy.
pub trait RegimePolicy: Send + Sync {
    /// Label a snippet. Always returns a value.
    fn classify(&self, text: &str) -> Regime;

    /// Whether a snippet describes a one-time or non-recurring event.
    fn is_one_time(&self, text: &str) -> bool;

    /// Two snippets are comparable iff they share a regime.
    fn is_comparable(&self, text_a: &str, text_b: &str) -> bool {
        self.classify(text_a) == self.classify(text_b)
    }

    /// Force one-time events in the new snippet down to Noise with a zero score.
    fn downgrade(
        &self,
        signal: SignalClassification,
        score: f64,
        text_new: &str,
    ) -> (SignalClassification, f64) {
        if self.is_one_time(text_new) {
            (SignalClassification::Noise, 0.0)
        } else {
            (signal, score)
        }
    }
}

pub const ACCOUNTING_KEYWORDS: &[&str] = &[
    "model",
    "policy",
    "provision",
    "impairment",
    "recognition",
    "pd",
    "lgd",
    "ead",
    "amortization",
    "depreciation",
    "expected credit loss",
    "ecl",
    "methodology",
];

pub const ONE_TIME_KEYWORDS: &[&str] = &[
    "one-time",
    "exceptional",
    "annual exercise",
    "court order",
    "ipo",
    "spin-off",
    "divestment",
    "tax reversal",
    "model refresh",
];

pub const GUIDANCE_KEYWORDS: &[&str] = &[
    "expect",
    "estimate",
    "guidance",
    "outlook",
    "forecast",
    "we believe",
    "target",
    "corridor",
];

/// Keyword-membership classifier: case-insensitive substring matching,
/// first hit wins in the order Accounting, OneTime, Guidance.
#[derive(Debug, Clone)]
pub struct KeywordRegimeClassifier {
    accounting: AhoCorasick,
    one_time: AhoCorasick,
    guidance: AhoCorasick,
}

static DEFAULT_CLASSIFIER: LazyLock<KeywordRegimeClassifier> = LazyLock::new(|| {
    KeywordRegimeClassifier::with_keywords(ACCOUNTING_KEYWORDS, ONE_TIME_KEYWORDS, GUIDANCE_KEYWORDS)
        .unwrap()
});

impl KeywordRegimeClassifier {
    /// Build a classifier from custom keyword lists.
    pub fn with_keywords<S: AsRef<[u8]>>(
        accounting: &[S],
        one_time: &[S],
        guidance: &[S],
    ) -> Result<Self, BuildError> {
        Ok(Self {
            accounting: matcher(accounting)?,
            one_time: matcher(one_time)?,
            guidance: matcher(guidance)?,
        })
    }
}

impl Default for KeywordRegimeClassifier {
    fn default() -> Self {
        DEFAULT_CLASSIFIER.clone()
    }
}

fn matcher<S: AsRef<[u8]>>(patterns: &[S]) -> Result<AhoCorasick, BuildError> {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(patterns)
}

impl RegimePolicy for KeywordRegimeClassifier {
    fn classify(&self, text: &str) -> Regime {
        if self.accounting.is_match(text) {
            Regime::Accounting
        } else if self.one_time.is_match(text) {
            Regime::OneTime
        } else if self.guidance.is_match(text) {
            Regime::Guidance
        } else {
            Regime::Operating
        }
    }

    fn is_one_time(&self, text: &str) -> bool {
        self.one_time.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("We changed our ECL methodology this quarter", Regime::Accounting)]
    #[test_case("A one-time gain from the divestment", Regime::OneTime)]
    #[test_case("We EXPECT margins to widen", Regime::Guidance)]
    #[test_case("Revenue grew 12% on volume", Regime::Operating)]
    #[test_case("Model refresh drove a one-time charge", Regime::Accounting ; "accounting wins over one-time")]
    #[test_case("Exceptional items; outlook unchanged", Regime::OneTime ; "one-time wins over guidance")]
    fn test_classify(text: &str, expected: Regime) {
        let classifier = KeywordRegimeClassifier::default();
        assert_eq!(classifier.classify(text), expected);
    }

    #[test]
    fn test_comparability_gate() {
        let classifier = KeywordRegimeClassifier::default();
        assert!(classifier.is_comparable("Sales rose", "Sales fell"));
        assert!(!classifier.is_comparable(
            "Loan book shrank in the quarter",
            "Provision methodology was revised"
        ));
    }

    #[test]
    fn test_downgrade_one_time() {
        let classifier = KeywordRegimeClassifier::default();
        let (signal, score) = classifier.downgrade(
            SignalClassification::Positive,
            6.0,
            "Gain driven by a court order reversal",
        );
        assert_eq!(signal, SignalClassification::Noise);
        assert_eq!(score, 0.0);

        let (signal, score) =
            classifier.downgrade(SignalClassification::Negative, -4.0, "Churn accelerated");
        assert_eq!(signal, SignalClassification::Negative);
        assert_eq!(score, -4.0);
    }

    #[test]
    fn test_custom_keywords() {
        let classifier =
            KeywordRegimeClassifier::with_keywords(&["ifrs 17"], &["strike"], &["plan"]).unwrap();
        assert_eq!(classifier.classify("IFRS 17 transition"), Regime::Accounting);
        assert_eq!(classifier.classify("Model drift"), Regime::Operating);
        assert!(classifier.is_one_time("port strike"));
    }
}
