use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BackendConfig, Credential};
use crate::error::{ErrorKind, LLMError};
use crate::stream::SseEvent;
use crate::types::{CapabilityDescriptor, ChatRequest, FinishReason, ProviderType, Role};

use super::{
    Dialect, ErrorRule, ParsedResponse, PromptProfile, StreamDelta, StructureStyle, UsageDelta,
    join_versioned, parse_json, string_extra,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";

const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule::code("authentication_error", ErrorKind::Authentication),
    ErrorRule::code("permission_error", ErrorKind::Authentication),
    ErrorRule::code("rate_limit_error", ErrorKind::RateLimit),
    ErrorRule::code("request_too_large", ErrorKind::ContextLimit),
    ErrorRule::code("overloaded_error", ErrorKind::ApiError),
    ErrorRule::code("api_error", ErrorKind::ApiError),
    ErrorRule::code("timeout_error", ErrorKind::Timeout),
    ErrorRule::status(400, ErrorKind::InvalidRequest),
    ErrorRule::status(401, ErrorKind::Authentication),
    ErrorRule::status(403, ErrorKind::Authentication),
    ErrorRule::status(413, ErrorKind::ContextLimit),
    ErrorRule::status(429, ErrorKind::RateLimit),
    ErrorRule::status(504, ErrorKind::Timeout),
    ErrorRule::range(500, 599, ErrorKind::ApiError),
];

/// Anthropic Messages API.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicMessages;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl From<Option<WireUsage>> for UsageDelta {
    fn from(usage: Option<WireUsage>) -> Self {
        usage
            .map(|usage| UsageDelta {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
            })
            .unwrap_or_default()
    }
}

/// Union of the stream event payloads the relay reads.
#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<WireResponse>,
    #[serde(default)]
    delta: Option<WireStreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

fn convert_stop_reason(reason: &str, backend: &str) -> Result<FinishReason, LLMError> {
    match reason {
        "max_tokens" => Ok(FinishReason::Length),
        "refusal" => Err(LLMError::ContentFilter {
            message: format!("{backend} refused to answer"),
        }),
        _ => Ok(FinishReason::Stop),
    }
}

impl Dialect for AnthropicMessages {
    fn name(&self) -> &'static str {
        "anthropic_messages"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn default_model(&self) -> &'static str {
        "claude-3-5-haiku-latest"
    }

    fn default_capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            max_context_tokens: 200_000,
            supports_function_calling: true,
            supports_vision: true,
            input_price_per_token: 0.000_000_8,
            output_price_per_token: 0.000_004,
            requests_per_minute: 50,
            tokens_per_minute: 50_000,
            strengths: vec![
                "analysis and reasoning".to_string(),
                "creative writing".to_string(),
                "long documents".to_string(),
                "code review".to_string(),
            ],
            ..CapabilityDescriptor::default()
        }
    }

    fn prompt_profile(&self) -> PromptProfile {
        PromptProfile {
            structure: StructureStyle::Xml,
            prompt_budget_percent: 60,
        }
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        join_versioned(base_url, "v1", "messages")
    }

    fn headers(&self, config: &BackendConfig) -> Result<HashMap<String, String>, LLMError> {
        let mut headers = HashMap::new();
        match &config.credential {
            Credential::ApiKey { header, key } => {
                let name = header.clone().unwrap_or_else(|| "x-api-key".to_string());
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
        headers.insert(
            "anthropic-version".to_string(),
            string_extra(config, "version").unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        );
        if let Some(beta) = string_extra(config, "beta") {
            headers.insert("anthropic-beta".to_string(), beta);
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Result<Value, LLMError> {
        let messages: Vec<WireMessage<'_>> = request
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .map(|message| WireMessage {
                role: message.role.as_str(),
                content: &message.content,
            })
            .collect();
        if messages.is_empty() {
            return Err(LLMError::Validation {
                message: "anthropic requests need at least one user or assistant message"
                    .to_string(),
            });
        }

        let body = WireRequest {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system_prompt.as_deref(),
            messages,
            stream,
        };
        serde_json::to_value(body).map_err(|err| LLMError::Validation {
            message: format!("failed to serialize request: {err}"),
        })
    }

    fn parse_response(&self, backend: &str, body: &str) -> Result<ParsedResponse, LLMError> {
        let parsed: WireResponse = parse_json(backend, "Anthropic response", body)?;
        let finish_reason = match parsed.stop_reason.as_deref() {
            Some(reason) => convert_stop_reason(reason, backend)?,
            None => FinishReason::Stop,
        };
        let content = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();

        Ok(ParsedResponse {
            content,
            finish_reason,
            model: parsed.model,
            usage: parsed.usage.into(),
        })
    }

    fn parse_stream_event(&self, backend: &str, event: &SseEvent) -> Result<StreamDelta, LLMError> {
        let parsed: WireStreamEvent = parse_json(backend, "Anthropic stream event", &event.data)?;
        let mut delta = StreamDelta::default();

        match parsed.kind.as_str() {
            "message_start" => {
                if let Some(message) = parsed.message {
                    delta.model = message.model;
                    delta.usage = message.usage.into();
                }
            }
            "content_block_delta" => {
                delta.text = parsed.delta.and_then(|d| d.text);
            }
            "message_delta" => {
                if let Some(reason) = parsed.delta.and_then(|d| d.stop_reason) {
                    delta.finish_reason = Some(convert_stop_reason(&reason, backend)?);
                }
                // message_delta only carries output tokens
                let usage: UsageDelta = parsed.usage.into();
                delta.usage.completion_tokens = usage.completion_tokens;
            }
            "message_stop" => delta.done = true,
            "error" => return Err(self.map_error(backend, None, &event.data, None)),
            _ => {}
        }
        Ok(delta)
    }

    fn error_rules(&self) -> &'static [ErrorRule] {
        ERROR_RULES
    }
}
