//! Language-model capabilities consumed by the pipeline.
//!
//! The pipeline never talks to a model directly. Every stage receives an
//! injected [`ExtractionCapability`] (and optionally a [`SearchCapability`])
//! and treats any [`CapabilityError`] as "no result".
//!
//! # Implementations
//!
//! - [`HttpCapability`]: both traits over the chat/search HTTP API
//! - test doubles in `tests/` implement the traits with scripted replies

pub mod http;
pub mod parse;

pub use http::HttpCapability;
pub use parse::{decode_structured, extract_json};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single capability call.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed capability output: {0}")]
    Malformed(String),

    #[error("capability rate limited")]
    RateLimited,

    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    /// Whether retrying the same call may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::RateLimited => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Malformed(_) | Self::Unavailable(_) => false,
        }
    }
}

/// Token usage reported by the capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Usage accrued since `earlier`.
    pub fn since(&self, earlier: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// What the capability produced: free text or a schema-conformant value.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl CapabilityOutput {
    /// Text form of the output; structured values are rendered as JSON.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(serde_json::Value::String(s)) => s.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

/// Result of one extraction call.
#[derive(Debug, Clone)]
pub struct CapabilityResponse {
    pub output: CapabilityOutput,
    pub usage: Usage,
}

/// One extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Logical agent name, used for routing and logs
    pub agent: String,
    /// Fixed instruction set
    pub system: String,
    /// Per-call payload
    pub payload: String,
    /// Optional JSON schema the output should conform to
    pub schema: Option<serde_json::Value>,
}

impl ExtractionRequest {
    pub fn new(agent: impl Into<String>, system: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            system: system.into(),
            payload: payload.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Result of one search-grounded call.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub text: String,
    pub sources: Vec<String>,
    pub usage: Usage,
}

/// "Ask the model for X" capability.
#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    async fn extract(&self, request: ExtractionRequest)
        -> Result<CapabilityResponse, CapabilityError>;

    /// Cumulative extraction usage of this capability instance.
    fn usage(&self) -> Usage {
        Usage::default()
    }
}

/// Search-and-summarize capability used by market validation.
#[async_trait]
pub trait SearchCapability: Send + Sync {
    async fn search_and_summarize(
        &self,
        system: &str,
        payload: &str,
    ) -> Result<SearchResult, CapabilityError>;
}
