mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{CannedResponse, MockTransport, collect, text_of};
use llm_relay::config::{OrchestratorConfig, ProviderDeps, ProviderRegistry};
use llm_relay::error::{ErrorKind, LLMError};
use llm_relay::provider::dialect::{AnthropicMessages, Dialect, GoogleGemini, OpenAiChat};
use llm_relay::ratelimit::ManualClock;
use llm_relay::{
    BackendConfig, ChatRequest, ConversationContext, Credential, FinishReason, HttpProvider,
    Message, Orchestrator, ProcessOptions, ProviderClient, SwitchReason,
};
use serde_json::Value;

fn provider(
    config: BackendConfig,
    dialect: Arc<dyn Dialect>,
    transport: Arc<MockTransport>,
) -> HttpProvider {
    HttpProvider::new(config, dialect, transport, Arc::new(ManualClock::new())).expect("provider")
}

fn openai_config() -> BackendConfig {
    BackendConfig::new("openai", "openai_chat")
        .with_credential(Credential::Bearer {
            token: "sk-test".into(),
        })
        .with_base_url("https://gateway.local/v1")
}

fn request() -> ChatRequest {
    ChatRequest::new("openai", vec![Message::user("Say hello")])
        .with_system_prompt("Be brief.")
        .with_max_tokens(32)
}

fn sse(data: &str) -> String {
    format!("data: {data}\n\n")
}

fn body_json(transport: &MockTransport, index: usize) -> Value {
    let recorded = transport.recorded();
    serde_json::from_slice(recorded[index].body.as_deref().expect("body")).expect("json body")
}

#[tokio::test]
async fn openai_chat_returns_normalized_response() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::Json(
            200,
            r#"{"model":"gpt-4o-mini-2024-07-18","choices":[{"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#.into(),
        )],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport.clone());

    let response = openai.chat(request()).await.expect("chat");
    assert_eq!(response.backend, "openai");
    assert_eq!(response.content, "Hello!");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model.as_deref(), Some("gpt-4o-mini-2024-07-18"));
    assert!(response.estimated_cost.is_some_and(|cost| cost > 0.0));

    let sent = &transport.recorded()[0];
    assert_eq!(sent.url, "https://gateway.local/v1/chat/completions");
    assert_eq!(
        sent.headers.get("Authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
    let body = body_json(&transport, 0);
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Say hello");
    assert_eq!(body["max_tokens"], 32);
}

#[tokio::test]
async fn rate_limit_status_carries_retry_after() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::JsonWithHeaders(
            429,
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#.into(),
            HashMap::from([("Retry-After".to_string(), "7".to_string())]),
        )],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport);

    let err = openai.chat(request()).await.expect_err("throttled");
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn context_overflow_is_classified_as_context_limit() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::Json(
            400,
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens.","type":"invalid_request_error","code":"context_length_exceeded"}}"#.into(),
        )],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport);

    let err = openai.chat(request()).await.expect_err("too long");
    assert!(matches!(err, LLMError::ContextLimit { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openai_stream_yields_deltas_then_one_terminal_chunk() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::Sse(vec![
            sse(r#"{"model":"gpt-4o-mini","choices":[{"delta":{"content":"Hel"}}]}"#),
            sse(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#),
            sse(r#"{"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#),
            sse("[DONE]"),
        ])],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport.clone());

    let chunks = collect(openai.stream_chat(request()).await.expect("stream")).await;
    assert_eq!(text_of(&chunks), "Hello");
    assert_eq!(chunks.len(), 3);
    let terminal = chunks.last().expect("terminal");
    assert!(terminal.finished);
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert_eq!(terminal.usage.map(|u| u.total_tokens), Some(6));
    assert!(chunks.iter().all(|c| c.model.as_deref() == Some("gpt-4o-mini")));

    let sent = &transport.recorded()[0];
    assert_eq!(
        sent.headers.get("Accept").map(String::as_str),
        Some("text/event-stream")
    );
    assert_eq!(body_json(&transport, 0)["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn truncated_stream_ends_with_error_chunk() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::Sse(vec![sse(
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
        )])],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport);

    let chunks = collect(openai.stream_chat(request()).await.expect("stream")).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].delta, "partial");
    let terminal = &chunks[1];
    assert!(terminal.finished && terminal.is_error());
    assert_eq!(
        terminal.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ApiError)
    );
}

#[tokio::test]
async fn failed_stream_open_is_an_error() {
    let transport = Arc::new(MockTransport::default().route(
        "chat/completions",
        vec![CannedResponse::Json(
            401,
            r#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#.into(),
        )],
    ));
    let openai = provider(openai_config(), Arc::new(OpenAiChat), transport);

    let err = openai.stream_chat(request()).await.err().expect("open fails");
    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn anthropic_stream_survives_split_events() {
    let start = r#"{"type":"message_start","message":{"model":"claude-3-5-haiku","content":[],"usage":{"input_tokens":25,"output_tokens":1}}}"#;
    let transport = Arc::new(MockTransport::default().route(
        "/v1/messages",
        vec![CannedResponse::Sse(vec![
            format!("event: message_start\ndata: {start}\n\n"),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\nevent: content_bl".to_string(),
            "ock_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"there\"}}\n\n".to_string(),
            "event: ping\ndata: {\"type\":\"ping\"}\n\n".to_string(),
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n\n".to_string(),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
        ])],
    ));
    let config = BackendConfig::new("claude", "anthropic_messages").with_credential(
        Credential::ApiKey {
            header: None,
            key: "sk-ant".into(),
        },
    );
    let claude = provider(config, Arc::new(AnthropicMessages), transport.clone());

    let chunks = collect(claude.stream_chat(request()).await.expect("stream")).await;
    assert_eq!(text_of(&chunks), "Hi there");
    let terminal = chunks.last().expect("terminal");
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    let usage = terminal.usage.expect("usage");
    assert_eq!((usage.prompt_tokens, usage.completion_tokens), (25, 5));
    assert_eq!(terminal.model.as_deref(), Some("claude-3-5-haiku"));

    let sent = &transport.recorded()[0];
    assert_eq!(sent.url, "https://api.anthropic.com/v1/messages");
    assert_eq!(sent.headers.get("x-api-key").map(String::as_str), Some("sk-ant"));
    assert_eq!(
        sent.headers.get("anthropic-version").map(String::as_str),
        Some("2023-06-01")
    );
    assert_eq!(body_json(&transport, 0)["system"], "Be brief.");
}

#[tokio::test]
async fn gemini_chat_uses_model_path_and_estimates_missing_usage() {
    let transport = Arc::new(MockTransport::default().route(
        ":generateContent",
        vec![CannedResponse::Json(
            200,
            r#"{"candidates":[{"content":{"parts":[{"text":"Bonjour"}],"role":"model"},"finishReason":"STOP"}]}"#.into(),
        )],
    ));
    let mut config = BackendConfig::new("gemini", "google_gemini").with_credential(
        Credential::ApiKey {
            header: None,
            key: "g-key".into(),
        },
    );
    config.default_model = Some("gemini-2.0-flash".into());
    let gemini = provider(config, Arc::new(GoogleGemini), transport.clone());

    let response = gemini.chat(request()).await.expect("chat");
    assert_eq!(response.content, "Bonjour");
    assert!(response.usage.prompt_tokens > 0);
    assert!(response.usage.completion_tokens > 0);

    let sent = &transport.recorded()[0];
    assert!(sent.url.ends_with("/v1beta/models/gemini-2.0-flash:generateContent"));
    assert_eq!(sent.headers.get("x-goog-api-key").map(String::as_str), Some("g-key"));
}

#[tokio::test]
async fn configured_orchestrator_falls_back_across_dialects() {
    let config = OrchestratorConfig::from_json_str(
        r#"{
            "default_backend": "openai",
            "fallback_order": ["claude"],
            "backends": [
                {"id": "openai", "dialect": "openai_chat", "base_url": "https://a.local"},
                {"id": "claude", "dialect": "anthropic_messages", "base_url": "https://b.local",
                 "credential": {"type": "api_key", "key": "sk-ant"}}
            ]
        }"#,
    )
    .expect("config");
    let transport = Arc::new(
        MockTransport::default()
            .route(
                "a.local",
                vec![CannedResponse::Json(
                    503,
                    r#"{"error":{"message":"overloaded","type":"server_error"}}"#.into(),
                )],
            )
            .route(
                "b.local",
                vec![CannedResponse::Json(
                    200,
                    r#"{"model":"claude-x","content":[{"type":"text","text":"Served by Claude"}],"stop_reason":"end_turn","usage":{"input_tokens":10,"output_tokens":4}}"#.into(),
                )],
            ),
    );
    let deps = ProviderDeps {
        transport: transport.clone(),
        clock: Arc::new(ManualClock::new()),
    };
    let orchestrator = Orchestrator::from_config_with(
        &config,
        &ProviderRegistry::with_builtin_dialects(),
        &deps,
    )
    .expect("orchestrator");

    let response = orchestrator
        .process("hello", "main", None, None, ProcessOptions::default())
        .await
        .expect("served");
    assert_eq!(response.backend, "claude");
    assert_eq!(response.content, "Served by Claude");
    assert_eq!(
        response.switch_event.map(|event| event.reason),
        Some(SwitchReason::Fallback)
    );

    let urls: Vec<String> = transport.recorded().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec!["https://a.local/v1/chat/completions", "https://b.local/v1/messages"]
    );
}

async fn body_for_summarized_call(capabilities: &str) -> String {
    let config = OrchestratorConfig::from_json_str(&format!(
        r#"{{"backends": [{{"id": "openai", "dialect": "openai_chat", "base_url": "https://a.local", "capabilities": {capabilities}}}]}}"#
    ))
    .expect("config");
    let transport = Arc::new(MockTransport::default().route(
        "a.local",
        vec![CannedResponse::Json(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}]}"#.into(),
        )],
    ));
    let deps = ProviderDeps {
        transport: transport.clone(),
        clock: Arc::new(ManualClock::new()),
    };
    let orchestrator = Orchestrator::from_config_with(
        &config,
        &ProviderRegistry::with_builtin_dialects(),
        &deps,
    )
    .expect("orchestrator");

    let context = ConversationContext::new("main").with_branch_summary("Discussing lifetimes");
    orchestrator
        .process(
            "What about 'static?",
            "main",
            None,
            Some(context),
            ProcessOptions::default().with_prompt_optimization(),
        )
        .await
        .expect("served");
    body_json(&transport, 0).to_string()
}

#[tokio::test]
async fn branch_summary_is_sent_exactly_once() {
    let with_system = body_for_summarized_call("{}").await;
    assert_eq!(with_system.matches("Discussing lifetimes").count(), 1);
    assert!(with_system.contains("Conversation summary"));

    let without_system =
        body_for_summarized_call(r#"{"supports_system_messages": false}"#).await;
    assert_eq!(without_system.matches("Discussing lifetimes").count(), 1);
    assert!(!without_system.contains("Conversation summary"));
}
