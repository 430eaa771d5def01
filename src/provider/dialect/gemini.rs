use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BackendConfig, Credential};
use crate::error::{ErrorKind, LLMError};
use crate::stream::SseEvent;
use crate::types::{CapabilityDescriptor, ChatRequest, FinishReason, ProviderType, Role};

use super::{
    Dialect, ErrorRule, ParsedResponse, PromptProfile, StreamDelta, StructureStyle, UsageDelta,
    join_versioned, parse_json,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule::code("API_KEY_INVALID", ErrorKind::Authentication),
    ErrorRule::code("RESOURCE_EXHAUSTED", ErrorKind::RateLimit),
    ErrorRule::code("UNAUTHENTICATED", ErrorKind::Authentication),
    ErrorRule::code("PERMISSION_DENIED", ErrorKind::Authentication),
    ErrorRule::code("DEADLINE_EXCEEDED", ErrorKind::Timeout),
    ErrorRule::code("UNAVAILABLE", ErrorKind::ApiError),
    ErrorRule::code("INTERNAL", ErrorKind::ApiError),
    ErrorRule::status(400, ErrorKind::InvalidRequest),
    ErrorRule::status(401, ErrorKind::Authentication),
    ErrorRule::status(403, ErrorKind::Authentication),
    ErrorRule::status(429, ErrorKind::RateLimit),
    ErrorRule::status(504, ErrorKind::Timeout),
    ErrorRule::range(500, 599, ErrorKind::ApiError),
];

/// Google Gemini `generateContent` API.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleGemini;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Debug, Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

impl From<Option<WireUsage>> for UsageDelta {
    fn from(usage: Option<WireUsage>) -> Self {
        usage
            .map(|usage| UsageDelta {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            })
            .unwrap_or_default()
    }
}

fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn convert_finish_reason(reason: &str, backend: &str) -> Result<FinishReason, LLMError> {
    match reason {
        "MAX_TOKENS" => Ok(FinishReason::Length),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            Err(LLMError::ContentFilter {
                message: format!("{backend} stopped generation: {reason}"),
            })
        }
        _ => Ok(FinishReason::Stop),
    }
}

/// Text, finish reason and usage shared by blocking and streamed payloads.
fn read_payload(
    parsed: WireResponse,
    backend: &str,
) -> Result<(String, Option<FinishReason>, Option<String>, UsageDelta), LLMError> {
    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(LLMError::ContentFilter {
            message: format!("{backend} blocked the prompt: {reason}"),
        });
    }
    let mut text = String::new();
    let mut finish_reason = None;
    if let Some(candidate) = parsed.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            text = content.parts.into_iter().filter_map(|p| p.text).collect();
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            finish_reason = Some(convert_finish_reason(reason, backend)?);
        }
    }
    Ok((
        text,
        finish_reason,
        parsed.model_version,
        parsed.usage_metadata.into(),
    ))
}

impl Dialect for GoogleGemini {
    fn name(&self) -> &'static str {
        "google_gemini"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::GoogleGemini
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn default_model(&self) -> &'static str {
        "gemini-2.0-flash"
    }

    fn default_capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            max_context_tokens: 1_000_000,
            supports_function_calling: true,
            supports_vision: true,
            input_price_per_token: 0.000_000_1,
            output_price_per_token: 0.000_000_4,
            requests_per_minute: 60,
            tokens_per_minute: 1_000_000,
            strengths: vec![
                "long documents".to_string(),
                "real-time search grounding".to_string(),
                "fast responses".to_string(),
            ],
            ..CapabilityDescriptor::default()
        }
    }

    fn prompt_profile(&self) -> PromptProfile {
        PromptProfile {
            structure: StructureStyle::Markdown,
            prompt_budget_percent: 70,
        }
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String {
        let model_path = normalize_model(model);
        if stream {
            join_versioned(
                base_url,
                "v1beta",
                &format!("{model_path}:streamGenerateContent?alt=sse"),
            )
        } else {
            join_versioned(base_url, "v1beta", &format!("{model_path}:generateContent"))
        }
    }

    fn headers(&self, config: &BackendConfig) -> Result<HashMap<String, String>, LLMError> {
        let mut headers = HashMap::new();
        match &config.credential {
            Credential::ApiKey { header, key } => {
                let name = header.clone().unwrap_or_else(|| "x-goog-api-key".to_string());
                headers.insert(name, key.clone());
            }
            Credential::Bearer { token } => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            Credential::None => {
                return Err(LLMError::Auth {
                    message: format!("backend {} requires a credential", config.id),
                });
            }
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ChatRequest, _model: &str, _stream: bool) -> Result<Value, LLMError> {
        let contents = request
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .map(|message| WireContent {
                role: Some(match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                }),
                parts: vec![WirePart {
                    text: &message.content,
                }],
            })
            .collect();

        let body = WireRequest {
            contents,
            system_instruction: request.system_prompt.as_deref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart { text }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        };
        serde_json::to_value(body).map_err(|err| LLMError::Validation {
            message: format!("failed to serialize request: {err}"),
        })
    }

    fn parse_response(&self, backend: &str, body: &str) -> Result<ParsedResponse, LLMError> {
        let parsed: WireResponse = parse_json(backend, "Gemini response", body)?;
        let (content, finish_reason, model, usage) = read_payload(parsed, backend)?;
        Ok(ParsedResponse {
            content,
            finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
            model,
            usage,
        })
    }

    /// Gemini has no end marker; the stream is complete once a finish reason arrived and
    /// the body closes.
    fn parse_stream_event(&self, backend: &str, event: &SseEvent) -> Result<StreamDelta, LLMError> {
        if event.data.contains("\"error\"") && self.native_error(&event.data).message.is_some() {
            return Err(self.map_error(backend, None, &event.data, None));
        }
        let parsed: WireResponse = parse_json(backend, "Gemini stream chunk", &event.data)?;
        let (text, finish_reason, model, usage) = read_payload(parsed, backend)?;
        Ok(StreamDelta {
            text: (!text.is_empty()).then_some(text),
            finish_reason,
            model,
            usage,
            done: false,
        })
    }

    fn error_rules(&self) -> &'static [ErrorRule] {
        ERROR_RULES
    }
}
