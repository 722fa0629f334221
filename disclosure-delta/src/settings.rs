//! Runtime settings derived from the shared configuration.

use std::time::Duration;

use disclosure_common::{Config, Error, Result};

use crate::capability::http::call_budget;
use crate::types::Section;

/// Resolved pipeline knobs, with section names parsed.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_section_length: usize,
    pub max_section_chars: usize,
    pub validation_context_chars: usize,
    pub max_changes_per_section: usize,
    pub noise_threshold: f64,
    pub score_bound: f64,
    pub worker_limit: usize,
    pub sections: Vec<Section>,
    /// Upper bound on one capability call, retries included
    pub call_timeout: Duration,
    pub market_enabled: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        // Default configuration always resolves.
        Self::resolve(&Config::default()).unwrap_or_else(|_| Self {
            min_section_length: 100,
            max_section_chars: 10_000,
            validation_context_chars: 40_000,
            max_changes_per_section: 5,
            noise_threshold: 0.5,
            score_bound: 10.0,
            worker_limit: 4,
            sections: Section::ALL.to_vec(),
            call_timeout: Duration::from_secs(60),
            market_enabled: false,
        })
    }
}

impl PipelineSettings {
    /// Resolve settings from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Self::resolve(config)
    }

    fn resolve(config: &Config) -> Result<Self> {
        let sections = config
            .pipeline
            .sections
            .iter()
            .map(|s| s.parse::<Section>().map_err(Error::Config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            min_section_length: config.pipeline.min_section_length,
            max_section_chars: config.pipeline.max_section_chars,
            validation_context_chars: config.pipeline.validation_context_chars,
            max_changes_per_section: config.pipeline.max_changes_per_section,
            noise_threshold: config.pipeline.noise_threshold,
            score_bound: config.pipeline.score_bound,
            worker_limit: config.pipeline.worker_limit.max(1),
            sections,
            call_timeout: call_budget(&config.capability),
            market_enabled: config.market.enabled,
        })
    }

    /// Copy with a short call timeout, for tests.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.sections, Section::ALL.to_vec());
        assert_eq!(settings.min_section_length, 100);
        // 60s × 3 attempts + 1s × 2 backoffs
        assert_eq!(settings.call_timeout, Duration::from_secs(182));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let mut config = Config::default();
        config.pipeline.sections = vec!["MD&A".into(), "Footnotes".into()];
        assert!(matches!(PipelineSettings::from_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.pipeline.worker_limit = 0;
        assert!(PipelineSettings::from_config(&config).is_err());
    }
}
