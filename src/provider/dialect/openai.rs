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

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule::code("context_length_exceeded", ErrorKind::ContextLimit),
    ErrorRule::code("invalid_api_key", ErrorKind::Authentication),
    ErrorRule::code("rate_limit_exceeded", ErrorKind::RateLimit),
    ErrorRule::code("content_filter", ErrorKind::ContentFilter),
    ErrorRule::code("content_policy_violation", ErrorKind::ContentFilter),
    ErrorRule::code("server_error", ErrorKind::ApiError),
    ErrorRule::status(400, ErrorKind::InvalidRequest),
    ErrorRule::status(401, ErrorKind::Authentication),
    ErrorRule::status(403, ErrorKind::Authentication),
    ErrorRule::status(408, ErrorKind::Timeout),
    ErrorRule::status(413, ErrorKind::ContextLimit),
    ErrorRule::status(422, ErrorKind::InvalidRequest),
    ErrorRule::status(429, ErrorKind::RateLimit),
    ErrorRule::status(504, ErrorKind::Timeout),
    ErrorRule::range(500, 599, ErrorKind::ApiError),
];

/// OpenAI Chat Completions and compatible servers (vLLM, Ollama, LM Studio, gateways).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiChat;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireContent>,
    #[serde(default)]
    delta: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

impl From<Option<WireUsage>> for UsageDelta {
    fn from(usage: Option<WireUsage>) -> Self {
        usage
            .map(|usage| UsageDelta {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .unwrap_or_default()
    }
}

fn convert_finish_reason(reason: &str, backend: &str) -> Result<FinishReason, LLMError> {
    match reason {
        "length" => Ok(FinishReason::Length),
        "content_filter" => Err(LLMError::ContentFilter {
            message: format!("{backend} stopped generation: content_filter"),
        }),
        _ => Ok(FinishReason::Stop),
    }
}

impl Dialect for OpenAiChat {
    fn name(&self) -> &'static str {
        "openai_chat"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn default_model(&self) -> &'static str {
        "gpt-4o-mini"
    }

    fn default_capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            max_context_tokens: 128_000,
            supports_function_calling: true,
            supports_vision: true,
            input_price_per_token: 0.000_000_15,
            output_price_per_token: 0.000_000_6,
            requests_per_minute: 500,
            tokens_per_minute: 200_000,
            strengths: vec![
                "code generation".to_string(),
                "general reasoning".to_string(),
                "fast responses".to_string(),
            ],
            ..CapabilityDescriptor::default()
        }
    }

    fn prompt_profile(&self) -> PromptProfile {
        PromptProfile {
            structure: StructureStyle::Markdown,
            prompt_budget_percent: 50,
        }
    }

    /// Local OpenAI-compatible servers usually run without auth.
    fn requires_credential(&self) -> bool {
        false
    }

    fn endpoint(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        join_versioned(base_url, "v1", "chat/completions")
    }

    fn headers(&self, config: &BackendConfig) -> Result<HashMap<String, String>, LLMError> {
        let mut headers = HashMap::new();
        match &config.credential {
            Credential::ApiKey {
                header: Some(header),
                key,
            } => {
                headers.insert(header.clone(), key.clone());
            }
            Credential::ApiKey { header: None, key } | Credential::Bearer { token: key } => {
                headers.insert("Authorization".to_string(), format!("Bearer {key}"));
            }
            Credential::None => {}
        }
        if let Some(org) = string_extra(config, "organization") {
            headers.insert("OpenAI-Organization".to_string(), org);
        }
        if let Some(project) = string_extra(config, "project") {
            headers.insert("OpenAI-Project".to_string(), project);
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Result<Value, LLMError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|message| WireMessage {
            role: message.role.as_str(),
            content: &message.content,
        }));

        let body = WireRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };
        serde_json::to_value(body).map_err(|err| LLMError::Validation {
            message: format!("failed to serialize request: {err}"),
        })
    }

    fn parse_response(&self, backend: &str, body: &str) -> Result<ParsedResponse, LLMError> {
        let parsed: WireResponse = parse_json(backend, "OpenAI response", body)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::provider(backend, "response contained no choices"))?;
        let message = choice.message.unwrap_or(WireContent {
            content: None,
            refusal: None,
        });
        if let Some(refusal) = message.refusal {
            return Err(LLMError::ContentFilter { message: refusal });
        }
        let finish_reason = match choice.finish_reason.as_deref() {
            Some(reason) => convert_finish_reason(reason, backend)?,
            None => FinishReason::Stop,
        };

        Ok(ParsedResponse {
            content: message.content.unwrap_or_default(),
            finish_reason,
            model: parsed.model,
            usage: parsed.usage.into(),
        })
    }

    fn parse_stream_event(&self, backend: &str, event: &SseEvent) -> Result<StreamDelta, LLMError> {
        if event.is_done_marker() {
            return Ok(StreamDelta {
                done: true,
                ..StreamDelta::default()
            });
        }
        if event.data.contains("\"error\"") {
            let native = self.native_error(&event.data);
            if native.message.is_some() {
                return Err(self.map_error(backend, None, &event.data, None));
            }
        }

        let parsed: WireResponse = parse_json(backend, "OpenAI stream chunk", &event.data)?;
        let mut delta = StreamDelta {
            model: parsed.model,
            usage: parsed.usage.into(),
            ..StreamDelta::default()
        };
        if let Some(choice) = parsed.choices.into_iter().next() {
            delta.text = choice.delta.and_then(|content| content.content);
            delta.finish_reason = match choice.finish_reason.as_deref() {
                Some(reason) => Some(convert_finish_reason(reason, backend)?),
                None => None,
            };
        }
        Ok(delta)
    }

    fn error_rules(&self) -> &'static [ErrorRule] {
        ERROR_RULES
    }
}
