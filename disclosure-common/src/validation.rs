//! Configuration validation for the disclosure pipeline.
//!
//! Rejects configurations that would make a run meaningless before any
//! capability call is made.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::{CapabilityConfig, Config, ObservabilityConfig, PipelineConfig, StorageConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.pipeline.validate() {
            errors.push(e);
        }
        if let Err(e) = self.capability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.storage.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load and validate configuration, applying environment overrides.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.worker_limit == 0 {
            return Err(ValidationError::InvalidValue {
                field: "pipeline.worker_limit".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_section_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "pipeline.max_section_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if !(self.score_bound.is_finite() && self.score_bound > 0.0) {
            return Err(ValidationError::InvalidValue {
                field: "pipeline.score_bound".into(),
                reason: "must be a positive number".into(),
            });
        }

        if !(self.noise_threshold >= 0.0 && self.noise_threshold < self.score_bound) {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "pipeline.noise_threshold ({}) must be in [0, score_bound={})",
                    self.noise_threshold, self.score_bound
                ),
            });
        }

        if self.sections.is_empty() {
            return Err(ValidationError::MissingField {
                field: "pipeline.sections".into(),
            });
        }

        let mut seen = HashSet::new();
        for section in &self.sections {
            if !seen.insert(section.as_str()) {
                return Err(ValidationError::InvalidValue {
                    field: "pipeline.sections".into(),
                    reason: format!("section '{}' listed twice", section),
                });
            }
        }

        Ok(())
    }
}

impl Validate for CapabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "capability.endpoint".into(),
            });
        }

        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ValidationError::InvalidValue {
                field: "capability.endpoint".into(),
                reason: "must start with http:// or https://".into(),
            });
        }

        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "capability.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

impl Validate for StorageConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.cache_key.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "storage.cache_key".into(),
            });
        }

        if self.facts_key.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "storage.facts_key".into(),
            });
        }

        if self.cache_key == self.facts_key {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "storage.cache_key and storage.facts_key are both '{}'",
                    self.cache_key
                ),
            });
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
