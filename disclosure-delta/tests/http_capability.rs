//! Integration tests for the HTTP capability against a mock model service.

use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use disclosure_common::CapabilityConfig;
use disclosure_delta::capability::{
    decode_structured, CapabilityError, CapabilityOutput, ExtractionCapability, ExtractionRequest,
    SearchCapability,
};
use disclosure_delta::{
    ChangeCache, Corpus, FactStore, HttpCapability, MemoryStore, OverallSignal, PipelineOrchestrator,
    PipelineSettings, Section, ValidationStatus,
};

fn config(server: &MockServer) -> CapabilityConfig {
    CapabilityConfig {
        endpoint: server.uri(),
        timeout_secs: 5,
        max_retries: 2,
        retry_backoff_ms: 10,
        ..Default::default()
    }
}

fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "content": content,
        "metadata": {"model": "test-model", "input_tokens": 100, "output_tokens": 20}
    }))
}

#[tokio::test]
async fn test_structured_output_is_preferred() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"user_id": "disclosure-delta", "agent": "probe"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "ignored prose",
            "structured": {"changes": []}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let capability = HttpCapability::new(config(&server));
    let response = capability
        .extract(ExtractionRequest::new("probe", "system", "payload"))
        .await
        .unwrap();

    assert_eq!(response.output, CapabilityOutput::Structured(json!({"changes": []})));
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(chat_reply("```json\n{\"value\": 7}\n```"))
        .mount(&server)
        .await;

    let capability = HttpCapability::new(config(&server));
    let response = capability
        .extract(ExtractionRequest::new("probe", "system", "payload"))
        .await
        .unwrap();

    let decoded: serde_json::Value = decode_structured(&response.output).unwrap();
    assert_eq!(decoded["value"], 7);
    assert_eq!(capability.usage().input_tokens, 100);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad schema"))
        .expect(1)
        .mount(&server)
        .await;

    let capability = HttpCapability::new(config(&server));
    let err = capability
        .extract(ExtractionRequest::new("probe", "system", "payload"))
        .await
        .unwrap_err();

    assert!(matches!(err, CapabilityError::Http { status: 400, ref body } if body == "bad schema"));
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let capability = HttpCapability::new(config(&server));
    let err = capability
        .extract(ExtractionRequest::new("probe", "system", "payload"))
        .await
        .unwrap_err();

    assert!(matches!(err, CapabilityError::RateLimited));
}

#[tokio::test]
async fn test_bearer_auth_and_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/search"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "SIGNAL: Demand\nSTATUS: aligned",
            "sources": ["https://news.example.com/a"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let capability = HttpCapability::new(CapabilityConfig {
        api_key: Some("secret".into()),
        ..config(&server)
    });

    assert!(capability.health_check().await);
    let result = capability.search_and_summarize("system", "payload").await.unwrap();
    assert_eq!(result.sources, vec!["https://news.example.com/a".to_string()]);
}

// ============================================================================
// Full pipeline over HTTP
// ============================================================================

fn section_change(quote_old: &str, quote_new: &str, signal: &str, score: f64) -> String {
    json!({"changes": [{
        "quote_old": quote_old,
        "quote_new": quote_new,
        "description": format!("{} -> {}", quote_old, quote_new),
        "signal_classification": signal,
        "signal_score": score
    }]})
    .to_string()
}

#[tokio::test]
async fn test_pipeline_against_model_service() {
    let server = MockServer::start().await;

    let replies = [
        (Section::MdA, section_change("Demand was soft", "Demand recovered strongly", "Positive", 6.0)),
        (Section::RiskFactors, section_change("Liquidity was ample", "Liquidity tightened", "Negative", -3.0)),
        (Section::Accounting, section_change("Margins were thin", "Margins widened", "Positive", 3.0)),
    ];
    for (section, reply) in &replies {
        Mock::given(method("POST"))
            .and(path("/api/v1/chat"))
            .and(body_partial_json(json!({"agent": "disclosure-delta"})))
            .and(body_string_contains(format!("the {} section", section)))
            .respond_with(chat_reply(reply))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"agent": "disclosure-judge"})))
        .respond_with(chat_reply(
            r#"{"results": [{"index": 1, "status": "Verified"}, {"index": 2, "status": "Verified"}, {"index": 3, "status": "Removed", "reason": "not in source"}]}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"agent": "disclosure-strategist"})))
        .respond_with(chat_reply(r#"{"insights": "Demand turned.", "verdict": "Mildly positive."}"#))
        .expect(1)
        .mount(&server)
        .await;

    let filler = "The business performed in line with plan across regions. ".repeat(3);
    let mut corpus = Corpus::new();
    for period in ["Q1_2024", "Q2_2024"] {
        let sections = corpus
            .entry("ACME".into())
            .or_default()
            .entry(period.into())
            .or_default();
        for section in Section::ALL {
            sections.insert(section.to_string(), format!("{} {} {}", section, period, filler));
        }
    }

    let capability = Arc::new(HttpCapability::new(config(&server)));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = PipelineOrchestrator::new(
        Arc::new(PipelineSettings::default()),
        capability,
        Arc::new(ChangeCache::new(store.clone(), "cache.json", Section::ALL.to_vec())),
        Arc::new(FactStore::new(store, "facts.json")),
    );

    let report = orchestrator.run(&corpus).await;

    let pair = &report.pairs[0];
    assert_eq!(pair.records.len(), 3);
    assert_eq!(pair.records[2].validation_status, Some(ValidationStatus::Removed));
    // Removed record excluded: mean of 6 and -3
    assert_eq!(pair.verdict.overall_score, 1.5);
    assert_eq!(pair.verdict.overall_signal, OverallSignal::Mixed);
    assert_eq!(pair.verdict.summary, "Demand turned.\n\nMildly positive.");
    assert_eq!(report.stats.usage.input_tokens, 500);
    assert_eq!(report.stats.usage.output_tokens, 100);
}
