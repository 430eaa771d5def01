//! Wire dialects spoken by [`crate::provider::HttpProvider`].
//!
//! A dialect owns everything vendor-specific: endpoint layout, auth headers, request and
//! response bodies, stream events and the table that maps native failures onto
//! [`ErrorKind`]. The adapter owns transport, timing, usage accounting and stream framing.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::{ErrorKind, LLMError, looks_like_token_limit_error};
use crate::stream::SseEvent;
use crate::types::{CapabilityDescriptor, ChatRequest, FinishReason, ProviderType};

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicMessages;
pub use gemini::GoogleGemini;
pub use openai::OpenAiChat;

/// How a native failure is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMatch {
    Status(u16),
    /// Inclusive status range.
    StatusRange(u16, u16),
    /// Vendor error code or type, compared case-insensitively.
    Code(&'static str),
}

/// One row of a dialect's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRule {
    pub matcher: ErrorMatch,
    pub kind: ErrorKind,
}

impl ErrorRule {
    pub const fn status(status: u16, kind: ErrorKind) -> Self {
        Self {
            matcher: ErrorMatch::Status(status),
            kind,
        }
    }

    pub const fn range(low: u16, high: u16, kind: ErrorKind) -> Self {
        Self {
            matcher: ErrorMatch::StatusRange(low, high),
            kind,
        }
    }

    pub const fn code(code: &'static str, kind: ErrorKind) -> Self {
        Self {
            matcher: ErrorMatch::Code(code),
            kind,
        }
    }

    fn matches_code(&self, code: Option<&str>) -> bool {
        match (self.matcher, code) {
            (ErrorMatch::Code(expected), Some(code)) => expected.eq_ignore_ascii_case(code),
            _ => false,
        }
    }

    fn matches_status(&self, status: Option<u16>) -> bool {
        match (self.matcher, status) {
            (ErrorMatch::Status(expected), Some(status)) => expected == status,
            (ErrorMatch::StatusRange(low, high), Some(status)) => (low..=high).contains(&status),
            _ => false,
        }
    }
}

/// Message and code pulled out of a native error body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeError {
    pub message: Option<String>,
    pub codes: Vec<String>,
}

/// Formatting conventions used by prompt optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureStyle {
    Xml,
    Markdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptProfile {
    pub structure: StructureStyle,
    /// Share of the context window a single prompt may occupy, in percent.
    pub prompt_budget_percent: u8,
}

/// Parsed non-streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub model: Option<String>,
    pub usage: UsageDelta,
}

/// Usage numbers reported so far; missing values are filled in by estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl UsageDelta {
    pub fn merge(&mut self, other: UsageDelta) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }
}

/// Meaning of one stream event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub text: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub model: Option<String>,
    pub usage: UsageDelta,
    /// The backend signalled the end of the stream.
    pub done: bool,
}

/// Vendor wire format.
pub trait Dialect: Send + Sync {
    /// Identifier used in configuration, e.g. `openai_chat`.
    fn name(&self) -> &'static str;

    fn provider_type(&self) -> ProviderType;

    fn default_base_url(&self) -> &'static str;

    fn default_model(&self) -> &'static str;

    fn default_capabilities(&self) -> CapabilityDescriptor;

    fn prompt_profile(&self) -> PromptProfile;

    /// Whether the dialect refuses to run with [`Credential::None`](crate::config::Credential::None).
    fn requires_credential(&self) -> bool {
        true
    }

    fn endpoint(&self, base_url: &str, model: &str, stream: bool) -> String;

    /// Auth and vendor headers, computed once at construction.
    fn headers(&self, config: &BackendConfig) -> Result<HashMap<String, String>, LLMError>;

    fn build_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Result<Value, LLMError>;

    /// Parses a successful body; policy refusals come back as [`LLMError::ContentFilter`].
    fn parse_response(&self, backend: &str, body: &str) -> Result<ParsedResponse, LLMError>;

    /// Interprets one SSE event; in-band error events come back as `Err`.
    fn parse_stream_event(&self, backend: &str, event: &SseEvent) -> Result<StreamDelta, LLMError>;

    fn error_rules(&self) -> &'static [ErrorRule];

    /// Extracts message and codes from `{"error": {...}}`, the envelope every supported
    /// vendor uses.
    fn native_error(&self, body: &str) -> NativeError {
        #[derive(Deserialize)]
        struct Envelope {
            error: Option<Value>,
        }

        let Some(error) = serde_json::from_str::<Envelope>(body)
            .ok()
            .and_then(|envelope| envelope.error)
        else {
            return NativeError::default();
        };

        let mut codes: Vec<String> = ["code", "type", "status"]
            .iter()
            .filter_map(|field| match error.get(*field) {
                Some(Value::String(code)) => Some(code.clone()),
                _ => None,
            })
            .collect();
        // google.rpc details carry the precise reason under a generic status
        if let Some(Value::Array(details)) = error.get("details") {
            codes.extend(
                details
                    .iter()
                    .filter_map(|detail| detail.get("reason").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
        NativeError {
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            codes,
        }
    }

    /// Classifies a failure: code rules first, then the context-window heuristic, then
    /// status rules. Unmatched 5xx statuses are API errors, anything else is unknown.
    fn map_error(
        &self,
        backend: &str,
        status: Option<u16>,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LLMError {
        let native = self.native_error(body);
        let message = native.message.clone().unwrap_or_else(|| {
            if body.trim().is_empty() {
                "empty error body".to_string()
            } else {
                body.trim().to_string()
            }
        });
        let rules = self.error_rules();

        let by_code = native.codes.iter().find_map(|code| {
            rules
                .iter()
                .find(|rule| rule.matches_code(Some(code)))
                .map(|rule| rule.kind)
        });
        let kind = by_code
            .or_else(|| {
                native
                    .codes
                    .iter()
                    .any(|code| looks_like_token_limit_error(Some(code), &message))
                    .then_some(ErrorKind::ContextLimit)
            })
            .or_else(|| {
                looks_like_token_limit_error(None, &message).then_some(ErrorKind::ContextLimit)
            })
            .or_else(|| {
                rules
                    .iter()
                    .find(|rule| rule.matches_status(status))
                    .map(|rule| rule.kind)
            })
            .unwrap_or(match status {
                Some(500..=599) => ErrorKind::ApiError,
                _ => ErrorKind::Unknown,
            });

        LLMError::classified(kind, backend, status, message, retry_after)
    }
}

/// Joins a base URL and a versioned path without doubling the version segment.
pub(crate) fn join_versioned(base_url: &str, version: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with(&format!("/{version}")) {
        format!("{base}/{path}")
    } else {
        format!("{base}/{version}/{path}")
    }
}

pub(crate) fn string_extra(config: &BackendConfig, key: &str) -> Option<String> {
    match config.extra.get(key) {
        Some(Value::String(value)) => Some(value.clone()),
        _ => None,
    }
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    backend: &str,
    what: &str,
    text: &str,
) -> Result<T, LLMError> {
    serde_json::from_str(text)
        .map_err(|err| LLMError::provider(backend, format!("failed to parse {what}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_join_does_not_duplicate_segment() {
        assert_eq!(
            join_versioned("https://api.example.com/", "v1", "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_versioned("http://localhost:8080/v1", "v1", "chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn usage_merge_keeps_latest_reported_values() {
        let mut usage = UsageDelta {
            prompt_tokens: Some(12),
            completion_tokens: None,
        };
        usage.merge(UsageDelta {
            prompt_tokens: None,
            completion_tokens: Some(7),
        });
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(7));
    }

    #[test]
    fn rules_match_codes_case_insensitively() {
        let rule = ErrorRule::code("rate_limit_exceeded", ErrorKind::RateLimit);
        assert!(rule.matches_code(Some("RATE_LIMIT_EXCEEDED")));
        assert!(!rule.matches_status(Some(429)));
        assert!(ErrorRule::range(500, 599, ErrorKind::ApiError).matches_status(Some(503)));
    }
}
