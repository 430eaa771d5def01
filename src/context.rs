//! Conversation context and request assembly.
//!
//! The caller hands the orchestrator a [`ConversationContext`] snapshot. [`ContextBuilder`]
//! optionally enriches it through an external [`ContextRetrieval`] collaborator and turns it
//! into the backend-agnostic [`ChatRequest`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LLMError;
use crate::types::{ChatRequest, Message, RequestMetadata, Role};

/// Number of history messages forwarded when nothing else is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Origin of a retrieved match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Message,
    Document,
    Concept,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedMatch {
    pub id: String,
    pub content: String,
    /// Similarity score; higher is more relevant.
    pub score: f64,
    pub kind: MatchType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub vector_matches: Vec<RetrievedMatch>,
    pub text_matches: Vec<RetrievedMatch>,
    pub hybrid_matches: Vec<RetrievedMatch>,
    pub retrieval_time_ms: u64,
}

/// Vector/full-text retrieval service owned by the embedding application.
#[async_trait]
pub trait ContextRetrieval: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        context: &ConversationContext,
        max_results: usize,
    ) -> Result<RetrievalResult, LLMError>;
}

pub type DynContextRetrieval = Arc<dyn ContextRetrieval>;

/// Read-only snapshot of the conversation passed into one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationContext {
    pub conversation_id: Option<String>,
    pub branch_id: String,
    /// Prior turns, oldest first.
    pub messages: Vec<Message>,
    pub branch_summary: Option<String>,
    pub custom_instructions: Option<String>,
    pub project_id: Option<String>,
    pub relevant_documents: Vec<RetrievedMatch>,
}

impl ConversationContext {
    pub fn new(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            ..Self::default()
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_custom_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.custom_instructions = Some(instructions.into());
        self
    }

    pub fn with_branch_summary(mut self, summary: impl Into<String>) -> Self {
        self.branch_summary = Some(summary.into());
        self
    }

    /// Folds `matches` into `relevant_documents`, keeping the best score per id and
    /// ordering the result by descending score.
    pub fn merge_matches(&mut self, matches: impl IntoIterator<Item = RetrievedMatch>) {
        let mut by_id: HashMap<String, RetrievedMatch> = HashMap::new();
        for candidate in self.relevant_documents.drain(..).chain(matches) {
            match by_id.get(&candidate.id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    by_id.insert(candidate.id.clone(), candidate);
                }
            }
        }
        let mut merged: Vec<RetrievedMatch> = by_id.into_values().collect();
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.relevant_documents = merged;
    }

    /// One-line description of what this context contributes to the prompt.
    pub fn summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(summary) = &self.branch_summary {
            parts.push(summary.clone());
        }
        if !self.messages.is_empty() {
            parts.push(format!("{} prior message(s)", self.messages.len()));
        }
        if !self.relevant_documents.is_empty() {
            parts.push(format!(
                "{} relevant document(s)",
                self.relevant_documents.len()
            ));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

/// Caps `default_max` so a response can be produced within `timeout_ms`.
///
/// Assumes roughly 40 generated tokens per second and never goes below 128 tokens.
///
/// ```
/// use llm_relay::context::max_tokens_for_timeout;
///
/// assert_eq!(max_tokens_for_timeout(4096, None), 4096);
/// assert_eq!(max_tokens_for_timeout(4096, Some(10_000)), 400);
/// assert_eq!(max_tokens_for_timeout(4096, Some(1_000)), 128);
/// assert_eq!(max_tokens_for_timeout(256, Some(60_000)), 256);
/// ```
pub fn max_tokens_for_timeout(default_max: u32, timeout_ms: Option<u64>) -> u32 {
    match timeout_ms {
        Some(timeout_ms) => {
            let budget = (timeout_ms / 1_000).saturating_mul(40).max(128);
            default_max.min(u32::try_from(budget).unwrap_or(u32::MAX))
        }
        None => default_max,
    }
}

/// Turns a context snapshot plus the new user turn into a [`ChatRequest`].
#[derive(Clone)]
pub struct ContextBuilder {
    history_limit: usize,
    retrieval: Option<DynContextRetrieval>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("history_limit", &self.history_limit)
            .field("retrieval", &self.retrieval.is_some())
            .finish()
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ContextBuilder {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            retrieval: None,
        }
    }

    pub fn with_retrieval(mut self, retrieval: DynContextRetrieval) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Runs retrieval for `query` and merges hybrid matches into the context.
    ///
    /// Retrieval failures are logged and the context is returned unchanged.
    pub async fn enrich(
        &self,
        query: &str,
        mut context: ConversationContext,
        max_results: usize,
    ) -> ConversationContext {
        let Some(retrieval) = &self.retrieval else {
            debug!("context retrieval requested but no retriever is configured");
            return context;
        };

        match retrieval.retrieve(query, &context, max_results).await {
            Ok(result) => {
                debug!(
                    matches = result.hybrid_matches.len(),
                    retrieval_time_ms = result.retrieval_time_ms,
                    "context retrieval finished"
                );
                context.merge_matches(result.hybrid_matches);
            }
            Err(err) => {
                warn!(error = %err, "context retrieval failed; continuing without it");
            }
        }
        context
    }

    /// Builds the request for `backend`. History is trimmed to the most recent messages and
    /// system-role history is dropped in favor of the assembled system prompt.
    pub fn build_request(
        &self,
        backend: &str,
        content: &str,
        context: &ConversationContext,
        max_tokens: u32,
        temperature: f32,
    ) -> ChatRequest {
        let history: Vec<&Message> = context
            .messages
            .iter()
            .filter(|message| message.role != Role::System)
            .collect();
        let start = history.len().saturating_sub(self.history_limit);

        let mut messages: Vec<Message> = history[start..].iter().map(|m| (*m).clone()).collect();
        messages.push(Message::user(content));

        let mut request = ChatRequest::new(backend, messages)
            .with_max_tokens(max_tokens)
            .with_temperature(temperature)
            .with_metadata(RequestMetadata {
                conversation_id: context.conversation_id.clone(),
                branch_id: Some(context.branch_id.clone()),
                project_id: context.project_id.clone(),
                context_summary: context.summary(),
            });
        request.system_prompt = system_prompt(context, true);
        request
    }
}

/// System prompt assembled from instructions, the branch summary and retrieved documents.
/// The summary is left out when the prompt text already carries it inline.
pub(crate) fn system_prompt(context: &ConversationContext, with_summary: bool) -> Option<String> {
    let mut sections = Vec::new();
    if let Some(instructions) = context.custom_instructions.as_deref() {
        if !instructions.trim().is_empty() {
            sections.push(instructions.trim().to_string());
        }
    }
    if let Some(summary) = context.branch_summary.as_deref().filter(|_| with_summary) {
        sections.push(format!("Conversation summary:\n{summary}"));
    }
    if !context.relevant_documents.is_empty() {
        let documents = context
            .relevant_documents
            .iter()
            .map(|doc| format!("- [{:?}] {}", doc.kind, doc.content))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Relevant context:\n{documents}"));
    }
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}
