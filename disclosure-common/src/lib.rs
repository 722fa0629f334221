//! Disclosure Common - Shared types, utilities, and configuration for the
//! disclosure delta pipeline.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Text utilities shared by the pipeline stages

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    CapabilityConfig, Config, MarketConfig, ObservabilityConfig, PipelineConfig, StorageBackend,
    StorageConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};
