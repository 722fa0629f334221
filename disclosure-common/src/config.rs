//! Configuration management for the disclosure pipeline.
//!
//! The pipeline reads a single configuration file at `~/.disclosure/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (DISCLOSURE_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `DISCLOSURE_CAPABILITY_ENDPOINT` → capability.endpoint
//! - `DISCLOSURE_CAPABILITY_API_KEY` → capability.api_key
//! - `DISCLOSURE_CAPABILITY_MODEL` → capability.model
//! - `DISCLOSURE_WORKERS` → pipeline.worker_limit
//! - `DISCLOSURE_DATA_DIR` → storage.data_dir
//! - `DISCLOSURE_STORAGE_BACKEND` → storage.backend
//! - `DISCLOSURE_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".disclosure"),
        |dirs| dirs.home_dir().join(".disclosure"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Tuning knobs for the comparison, validation and aggregation stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sections shorter than this (in characters) are never sent to the model
    #[serde(default = "default_min_section_length")]
    pub min_section_length: usize,

    /// Section text is cut to this many characters before comparison
    #[serde(default = "default_max_section_chars")]
    pub max_section_chars: usize,

    /// Source text is cut to this many characters before cross validation
    #[serde(default = "default_validation_context_chars")]
    pub validation_context_chars: usize,

    /// Number of change candidates requested per section
    #[serde(default = "default_max_changes_per_section")]
    pub max_changes_per_section: usize,

    /// Largest absolute score a Noise record may carry
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f64,

    /// Scores and the overall verdict are clamped to [-bound, +bound]
    #[serde(default = "default_score_bound")]
    pub score_bound: f64,

    /// Maximum number of (entity, quarter pair) units running at once
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    /// Topical sections compared for every quarter pair
    #[serde(default = "default_sections")]
    pub sections: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_section_length: default_min_section_length(),
            max_section_chars: default_max_section_chars(),
            validation_context_chars: default_validation_context_chars(),
            max_changes_per_section: default_max_changes_per_section(),
            noise_threshold: default_noise_threshold(),
            score_bound: default_score_bound(),
            worker_limit: default_worker_limit(),
            sections: default_sections(),
        }
    }
}

// ============================================================================
// Capability Configuration
// ============================================================================

/// Connection settings for the language-model capability service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Base URL of the capability service
    #[serde(default = "default_capability_endpoint")]
    pub endpoint: String,

    /// Model hint forwarded with every request
    #[serde(default)]
    pub model: Option<String>,

    /// Bearer token for the capability service
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-call timeout in seconds
    #[serde(default = "default_capability_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_capability_retries")]
    pub max_retries: u32,

    /// Pause between retries in milliseconds
    #[serde(default = "default_capability_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            endpoint: default_capability_endpoint(),
            model: None,
            api_key: None,
            timeout_secs: default_capability_timeout(),
            max_retries: default_capability_retries(),
            retry_backoff_ms: default_capability_backoff_ms(),
        }
    }
}

impl CapabilityConfig {
    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Pause between retries.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Backend used for the change-record cache and the fact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One JSON file per store under `data_dir`
    #[default]
    File,
    /// A single SQLite database at `sqlite_path`
    Sqlite,
}

/// Where cached analysis and facts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory for the file backend (`~` is expanded)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Database path for the sqlite backend (`~` is expanded)
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Store key of the change-record cache
    #[serde(default = "default_cache_key")]
    pub cache_key: String,

    /// Store key of the fact store
    #[serde(default = "default_facts_key")]
    pub facts_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            sqlite_path: default_sqlite_path(),
            cache_key: default_cache_key(),
            facts_key: default_facts_key(),
        }
    }
}

impl StorageConfig {
    /// Data directory with `~` expanded.
    pub fn data_dir_path(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// SQLite path with `~` expanded.
    pub fn sqlite_file_path(&self) -> PathBuf {
        expand_path(&self.sqlite_path)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// ============================================================================
// Market / Observability
// ============================================================================

/// Market cross-check settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketConfig {
    /// Run the search-grounded market check after cross validation
    #[serde(default)]
    pub enabled: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub capability: CapabilityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("DISCLOSURE_CAPABILITY_ENDPOINT") {
            self.capability.endpoint = endpoint;
        }
        if let Some(key) = lookup("DISCLOSURE_CAPABILITY_API_KEY") {
            self.capability.api_key = Some(key);
        }
        if let Some(model) = lookup("DISCLOSURE_CAPABILITY_MODEL") {
            self.capability.model = Some(model);
        }
        if let Some(workers) = lookup("DISCLOSURE_WORKERS") {
            match workers.parse() {
                Ok(n) => self.pipeline.worker_limit = n,
                Err(_) => tracing::warn!(value = %workers, "Ignoring invalid DISCLOSURE_WORKERS"),
            }
        }
        if let Some(dir) = lookup("DISCLOSURE_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(backend) = lookup("DISCLOSURE_STORAGE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "file" => self.storage.backend = StorageBackend::File,
                "sqlite" => self.storage.backend = StorageBackend::Sqlite,
                other => tracing::warn!(value = %other, "Ignoring unknown storage backend"),
            }
        }
        if let Some(level) = lookup("DISCLOSURE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create config directory {}", dir.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_min_section_length() -> usize {
    100
}

fn default_max_section_chars() -> usize {
    10_000
}

fn default_validation_context_chars() -> usize {
    40_000
}

fn default_max_changes_per_section() -> usize {
    5
}

fn default_noise_threshold() -> f64 {
    0.5
}

fn default_score_bound() -> f64 {
    10.0
}

fn default_worker_limit() -> usize {
    4
}

fn default_sections() -> Vec<String> {
    vec![
        "MD&A".to_string(),
        "Risk_Factors".to_string(),
        "Accounting".to_string(),
    ]
}

fn default_capability_endpoint() -> String {
    "http://127.0.0.1:4400".into()
}

fn default_capability_timeout() -> u64 {
    60
}

fn default_capability_retries() -> u32 {
    2
}

fn default_capability_backoff_ms() -> u64 {
    1000
}

fn default_data_dir() -> String {
    "~/.disclosure/data".into()
}

fn default_sqlite_path() -> String {
    "~/.disclosure/disclosure.db".into()
}

fn default_cache_key() -> String {
    "analysis_cache.json".into()
}

fn default_facts_key() -> String {
    "financial_facts.json".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
