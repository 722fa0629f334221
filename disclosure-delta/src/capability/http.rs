//! HTTP bridge to the language-model service.
//!
//! Talks to the chat endpoint (`/api/v1/chat`) for extraction and the
//! search endpoint (`/api/v1/search`) for grounded summaries, retrying
//! recoverable failures with a fixed backoff.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use disclosure_common::CapabilityConfig;

use super::{
    CapabilityError, CapabilityOutput, CapabilityResponse, ExtractionCapability,
    ExtractionRequest, SearchCapability, SearchResult, Usage,
};

const USER_ID: &str = "disclosure-delta";

/// Request to the chat endpoint.
#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    user_id: &'a str,
    agent: &'a str,
    system: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a serde_json::Value>,
}

/// Response from the chat endpoint.
#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    structured: Option<serde_json::Value>,
    #[serde(default)]
    metadata: Option<ResponseMetadata>,
}

/// Request to the search endpoint.
#[derive(Debug, Clone, Serialize)]
struct SearchRequest<'a> {
    user_id: &'a str,
    system: &'a str,
    message: &'a str,
}

/// Response from the search endpoint.
#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ResponseMetadata {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl ResponseMetadata {
    fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
        }
    }
}

/// Capability backed by the model service's HTTP API.
pub struct HttpCapability {
    config: CapabilityConfig,
    client: reqwest::Client,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl HttpCapability {
    pub fn new(config: CapabilityConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            client,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn record_usage(&self, usage: Usage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    /// Send a request, retrying recoverable failures.
    async fn send_with_retry<Req, Resp>(
        &self,
        path: &str,
        label: &str,
        request: &Req,
    ) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let url = self.url(path);
        let max_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.try_send(&url, request).await {
                Ok(response) => {
                    info!(agent = %label, attempt, "Capability request successful");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        agent = %label,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Capability request failed"
                    );
                    let recoverable = e.is_recoverable();
                    last_error = Some(e);

                    if !recoverable {
                        break;
                    }
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff()).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CapabilityError::Unavailable("no attempt made".into())))
    }

    /// Try to send a single request.
    async fn try_send<Req, Resp>(&self, url: &str, request: &Req) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        debug!(url, "Sending request to model service");

        let mut builder = self.client.post(url).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CapabilityError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| CapabilityError::Malformed(format!("response body: {}", e)))
    }

    fn classify(&self, error: reqwest::Error) -> CapabilityError {
        if error.is_timeout() {
            CapabilityError::Timeout(self.config.timeout())
        } else {
            CapabilityError::Transport(error.to_string())
        }
    }

    /// Check if the model service is available.
    pub async fn health_check(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Worst-case wall time of one call including retries.
    pub fn call_budget(&self) -> Duration {
        call_budget(&self.config)
    }
}

/// Worst-case wall time of one call under `config`, including retries.
pub fn call_budget(config: &CapabilityConfig) -> Duration {
    let attempts = config.max_retries + 1;
    config.timeout() * attempts + config.retry_backoff() * config.max_retries
}

#[async_trait]
impl ExtractionCapability for HttpCapability {
    async fn extract(
        &self,
        request: ExtractionRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let body = ChatRequest {
            user_id: USER_ID,
            agent: &request.agent,
            system: &request.system,
            message: &request.payload,
            model: self.config.model.as_deref(),
            response_schema: request.schema.as_ref(),
        };

        let response: ChatResponse = self.send_with_retry("/api/v1/chat", &request.agent, &body).await?;
        let metadata = response.metadata.unwrap_or_default();
        let usage = metadata.usage();
        debug!(
            agent = %request.agent,
            model = metadata.model.as_deref().unwrap_or("unknown"),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Extraction usage"
        );
        self.record_usage(usage);

        let output = match response.structured {
            Some(value) if !value.is_null() => CapabilityOutput::Structured(value),
            _ => CapabilityOutput::Text(response.content),
        };

        Ok(CapabilityResponse { output, usage })
    }

    fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SearchCapability for HttpCapability {
    async fn search_and_summarize(
        &self,
        system: &str,
        payload: &str,
    ) -> Result<SearchResult, CapabilityError> {
        let body = SearchRequest {
            user_id: USER_ID,
            system,
            message: payload,
        };

        let response: SearchResponse = self.send_with_retry("/api/v1/search", "search", &body).await?;
        // Search usage is reported per call only; the cumulative counters
        // track extraction.
        let usage = response.metadata.unwrap_or_default().usage();

        Ok(SearchResult {
            text: response.content,
            sources: response.sources,
            usage,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
