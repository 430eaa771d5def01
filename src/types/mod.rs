//! Shared data structures for normalized requests, responses and backend metadata.
//!
//! These types keep the orchestration layer agnostic of individual backend wire formats;
//! dialects convert to and from them at the HTTP boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, LLMError};

/// Chat role understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Normalized chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Correlation data forwarded with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub conversation_id: Option<String>,
    pub branch_id: Option<String>,
    pub project_id: Option<String>,
    /// One-line description of the context that was folded into the prompt.
    pub context_summary: Option<String>,
}

/// Backend-agnostic completion request.
///
/// Built once per `process` call. When the orchestrator falls back it calls
/// [`ChatRequest::retarget`], which swaps the backend and drops any model pinned for the
/// previous one.
///
/// # Examples
///
/// ```
/// # use llm_relay::types::{ChatRequest, Message};
/// let request = ChatRequest::new("alpha", vec![Message::user("Summarize Rust traits.")])
///     .with_system_prompt("You are concise.")
///     .with_max_tokens(256);
/// let retargeted = request.retarget("beta");
/// assert_eq!(retargeted.backend, "beta");
/// assert_eq!(retargeted.max_tokens, 256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Ordered conversation, ending with the user turn.
    pub messages: Vec<Message>,
    /// Identifier of the backend this request targets.
    pub backend: String,
    /// Model override; the backend's configured default applies when `None`.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Instructions sent through the backend's system channel.
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl ChatRequest {
    pub fn new(backend: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            backend: backend.into(),
            model: None,
            max_tokens: 1024,
            temperature: 0.7,
            system_prompt: None,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Copy of this request aimed at another backend.
    pub fn retarget(&self, backend: &str) -> Self {
        let mut request = self.clone();
        request.backend = backend.to_string();
        request.model = None;
        request
    }

    /// Content of the last user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

/// Why a response stopped generating content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

/// Token usage reported by the backend (or estimated when the backend stays silent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Before/after sample of one prompt rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTransform {
    /// Transform identifier such as `structure_markers`.
    pub name: String,
    pub before: String,
    pub after: String,
}

/// Output of [`crate::provider::ProviderClient::optimize_prompt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOptimization {
    pub optimized_text: String,
    pub applied: Vec<AppliedTransform>,
}

impl PromptOptimization {
    pub fn unchanged(text: impl Into<String>) -> Self {
        Self {
            optimized_text: text.into(),
            applied: Vec::new(),
        }
    }
}

/// Normalized result of a blocking completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    /// Backend that actually served the request.
    pub backend: String,
    /// Effective model identifier reported by the backend.
    pub model: Option<String>,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Switch recorded by the orchestrator for this turn, if the serving backend changed.
    pub switch_event: Option<ModelSwitchEvent>,
    /// Prompt rewrites applied before sending.
    #[serde(default)]
    pub optimizations: Vec<AppliedTransform>,
    pub estimated_cost: Option<f64>,
}

impl ChatResponse {
    /// Builds a response stamped with a fresh id and the current time.
    pub fn new(
        backend: impl Into<String>,
        content: impl Into<String>,
        finish_reason: FinishReason,
        usage: TokenUsage,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            backend: backend.into(),
            model: None,
            content: content.into(),
            finish_reason,
            usage,
            processing_time_ms: 0,
            timestamp: Utc::now(),
            switch_event: None,
            optimizations: Vec::new(),
            estimated_cost: None,
        }
    }
}

/// Error payload carried by a terminal error chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    /// Set when the orchestrator gave up after walking the whole fallback chain.
    #[serde(default)]
    pub exhausted: bool,
}

impl From<&LLMError> for ChunkError {
    fn from(err: &LLMError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            exhausted: err.is_exhausted(),
        }
    }
}

impl ChunkError {
    /// Rebuilds a classified error so a failed stream can drive fallback like a failed call.
    pub fn to_error(&self, backend: &str) -> LLMError {
        LLMError::classified(
            self.kind,
            backend,
            None,
            self.message.clone(),
            self.retry_after_ms.map(std::time::Duration::from_millis),
        )
    }
}

/// One incremental unit of a streamed response.
///
/// Only the terminal chunk has `finished == true`; it alone carries `finish_reason`,
/// `usage` and, for failed streams, `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub backend: String,
    pub model: Option<String>,
    /// Text generated since the previous chunk.
    pub delta: String,
    pub finished: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    pub error: Option<ChunkError>,
    /// Set on the first chunk of a restarted generation after a mid-stream fallback.
    #[serde(default)]
    pub restart: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatChunk {
    pub fn delta(id: &str, backend: &str, delta: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            backend: backend.to_string(),
            model: None,
            delta: delta.into(),
            finished: false,
            finish_reason: None,
            usage: None,
            error: None,
            restart: false,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(id: &str, backend: &str, finish_reason: FinishReason, usage: TokenUsage) -> Self {
        Self {
            finished: true,
            finish_reason: Some(finish_reason),
            usage: Some(usage),
            ..Self::delta(id, backend, String::new())
        }
    }

    pub fn failed(id: &str, backend: &str, err: &LLMError) -> Self {
        Self {
            finished: true,
            finish_reason: Some(FinishReason::Error),
            error: Some(ChunkError::from(err)),
            ..Self::delta(id, backend, String::new())
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.finish_reason == Some(FinishReason::Error)
    }
}

/// Why the serving backend changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    UserRequest,
    Failure,
    Optimization,
    Fallback,
}

/// Immutable record of a backend change for one conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSwitchEvent {
    pub id: String,
    pub from: Option<String>,
    pub to: String,
    pub reason: SwitchReason,
    pub conversation_id: Option<String>,
    pub branch_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub context_preserved: bool,
    pub switch_latency_ms: u64,
}

/// Static metadata describing what a backend can do and what it costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityDescriptor {
    /// Maximum context length in tokens.
    pub max_context_tokens: u32,
    pub supports_streaming: bool,
    pub supports_system_messages: bool,
    pub supports_function_calling: bool,
    pub supports_vision: bool,
    /// USD per input token.
    pub input_price_per_token: f64,
    /// USD per output token.
    pub output_price_per_token: f64,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub languages: Vec<String>,
    /// Free-text strengths, matched against content signals by the selector.
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self {
            max_context_tokens: 8_192,
            supports_streaming: true,
            supports_system_messages: true,
            supports_function_calling: false,
            supports_vision: false,
            input_price_per_token: 0.0,
            output_price_per_token: 0.0,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            languages: vec!["en".to_string()],
            strengths: Vec::new(),
            weaknesses: Vec::new(),
        }
    }
}

impl CapabilityDescriptor {
    /// Whether any declared strength mentions one of `keywords` (case-insensitive).
    pub fn has_strength(&self, keywords: &[&str]) -> bool {
        self.strengths.iter().any(|strength| {
            let lower = strength.to_ascii_lowercase();
            keywords.iter().any(|keyword| lower.contains(keyword))
        })
    }
}

/// Groups backend families that share similar tokenization characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// OpenAI-style tokenizer with ~4 ASCII chars per token.
    OpenAI,
    /// Anthropic Claude models follow OpenAI-like heuristics for mixed locales.
    Anthropic,
    /// Google Gemini tokenizes English slightly more aggressively (~4.5 chars/token).
    GoogleGemini,
}

/// Estimates token counts using provider-specific heuristics.
///
/// The estimator favors simplicity over exact parity with vendor tokenizers, so the
/// returned counts are approximate but deterministic. The relay uses it for cost
/// estimates, token-window accounting when a backend omits usage, and prompt truncation.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    provider_type: ProviderType,
}

impl TokenEstimator {
    pub fn new(provider_type: ProviderType) -> Self {
        Self { provider_type }
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Estimates the number of tokens for a piece of text.
    pub fn estimate_text(&self, text: &str) -> usize {
        let mut total_chars = 0usize;
        let mut ascii_chars = 0usize;

        for ch in text.chars() {
            total_chars += 1;
            if ch.is_ascii() {
                ascii_chars += 1;
            }
        }

        if total_chars == 0 {
            return 0;
        }

        ((total_chars as f64) / self.chars_per_token(ascii_chars, total_chars)).ceil() as usize
    }

    /// Approximate number of characters that fit in `tokens`, assuming mostly ASCII text.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token(1, 1)).floor() as usize
    }

    fn chars_per_token(&self, ascii_chars: usize, total_chars: usize) -> f64 {
        let ascii_ratio = ascii_chars as f64 / total_chars as f64;
        match self.provider_type {
            ProviderType::OpenAI | ProviderType::Anthropic => 2.0 + 2.0 * ascii_ratio,
            ProviderType::GoogleGemini => 4.5,
        }
    }

    /// Estimates the prompt tokens of an entire request, including per-message framing.
    ///
    /// # Examples
    ///
    /// ```
    /// # use llm_relay::types::{ChatRequest, Message, ProviderType, TokenEstimator};
    /// let request = ChatRequest::new("alpha", vec![Message::user("Explain enums")])
    ///     .with_system_prompt("You are terse");
    /// let estimate = TokenEstimator::new(ProviderType::OpenAI).estimate_request(&request);
    /// assert!(estimate.total > estimate.overhead);
    /// assert!(estimate.by_role.contains_key("system"));
    /// ```
    pub fn estimate_request(&self, request: &ChatRequest) -> TokenEstimate {
        const OVERHEAD_PER_MESSAGE: usize = 4;

        let mut total = 0usize;
        let mut by_role: HashMap<String, usize> = HashMap::new();
        let mut message_count = 0usize;

        if let Some(system) = &request.system_prompt {
            let tokens = OVERHEAD_PER_MESSAGE + self.estimate_text(system);
            *by_role.entry(Role::System.as_str().to_string()).or_insert(0) += tokens;
            total += tokens;
            message_count += 1;
        }

        for message in &request.messages {
            let tokens = OVERHEAD_PER_MESSAGE + self.estimate_text(&message.content);
            *by_role.entry(message.role.as_str().to_string()).or_insert(0) += tokens;
            total += tokens;
            message_count += 1;
        }

        TokenEstimate {
            total,
            by_role,
            overhead: OVERHEAD_PER_MESSAGE * message_count,
        }
    }
}

/// Token estimate breakdown for a chat request.
#[derive(Debug, Clone)]
pub struct TokenEstimate {
    /// Estimated total tokens in the request payload.
    pub total: usize,
    /// Breakdown aggregated by chat role.
    pub by_role: HashMap<String, usize>,
    /// Per-message framing overhead used in the calculation.
    pub overhead: usize,
}
