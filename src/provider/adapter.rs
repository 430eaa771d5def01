use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::{BackendConfig, Credential};
use crate::context::ConversationContext;
use crate::error::LLMError;
use crate::http::{DynHttpTransport, HttpRequest, retry_after_from_headers};
use crate::ratelimit::{DynClock, RateLimitTracker};
use crate::stream::SseDecoder;
use crate::types::{
    CapabilityDescriptor, ChatChunk, ChatRequest, ChatResponse, FinishReason, Message,
    PromptOptimization, ProviderType, TokenEstimator, TokenUsage,
};

use super::dialect::{Dialect, UsageDelta};
use super::{ChatStream, ProviderClient, optimize};

/// Generic HTTP backend: one instance per configured backend, with the vendor wire format
/// supplied by a [`Dialect`].
pub struct HttpProvider {
    config: BackendConfig,
    dialect: Arc<dyn Dialect>,
    transport: DynHttpTransport,
    capabilities: CapabilityDescriptor,
    rate_limiter: RateLimitTracker,
    base_url: String,
    headers: HashMap<String, String>,
    estimator: TokenEstimator,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("id", &self.config.id)
            .field("dialect", &self.dialect.name())
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    /// Builds the backend, merging dialect defaults with configuration overrides.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Auth`] when the dialect needs a credential and none is configured.
    pub fn new(
        config: BackendConfig,
        dialect: Arc<dyn Dialect>,
        transport: DynHttpTransport,
        clock: DynClock,
    ) -> Result<Self, LLMError> {
        if dialect.requires_credential() && matches!(config.credential, Credential::None) {
            return Err(LLMError::Auth {
                message: format!(
                    "backend {} ({}) requires a credential",
                    config.id,
                    dialect.name()
                ),
            });
        }

        let capabilities = config.effective_capabilities(dialect.default_capabilities());
        let rate_limiter = RateLimitTracker::new(
            u64::from(capabilities.requests_per_minute),
            capabilities.tokens_per_minute,
            clock,
        );
        let headers = dialect.headers(&config)?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| dialect.default_base_url().to_string());
        let estimator = TokenEstimator::new(dialect.provider_type());

        Ok(Self {
            config,
            dialect,
            transport,
            capabilities,
            rate_limiter,
            base_url,
            headers,
            estimator,
        })
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    fn resolve_model(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| self.dialect.default_model().to_string())
    }

    fn build_http_request(
        &self,
        request: &ChatRequest,
        model: &str,
        stream: bool,
    ) -> Result<HttpRequest, LLMError> {
        let body = self.dialect.build_body(request, model, stream)?;
        let url = self.dialect.endpoint(&self.base_url, model, stream);
        let mut headers = self.headers.clone();
        if stream {
            headers.insert("Accept".to_string(), "text/event-stream".to_string());
        }
        Ok(HttpRequest::post_json(url, &body)?
            .with_headers(headers)
            .with_timeout(self.config.timeout_ms.map(Duration::from_millis)))
    }

    fn usage_or_estimate(&self, request: &ChatRequest, reported: UsageDelta, content: &str) -> TokenUsage {
        let prompt = reported
            .prompt_tokens
            .unwrap_or_else(|| self.estimator.estimate_request(request).total as u64);
        let completion = reported
            .completion_tokens
            .unwrap_or_else(|| self.estimator.estimate_text(content) as u64);
        TokenUsage::new(prompt, completion)
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    fn rate_limiter(&self) -> &RateLimitTracker {
        &self.rate_limiter
    }

    fn provider_type(&self) -> ProviderType {
        self.dialect.provider_type()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let started = Instant::now();
        let model = self.resolve_model(&request);
        let http_request = self.build_http_request(&request, &model, false)?;

        let response = self.transport.send(http_request).await?;
        let status = response.status;
        let retry_after = retry_after_from_headers(&response.headers);
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(self.dialect.map_error(self.id(), Some(status), &text, retry_after));
        }

        let parsed = self.dialect.parse_response(self.id(), &text)?;
        let usage = self.usage_or_estimate(&request, parsed.usage, &parsed.content);
        let mut chat_response =
            ChatResponse::new(self.id(), parsed.content, parsed.finish_reason, usage);
        chat_response.model = parsed.model.or(Some(model));
        chat_response.processing_time_ms = started.elapsed().as_millis() as u64;
        chat_response.estimated_cost = Some(self.estimate_cost(&request));
        Ok(chat_response)
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LLMError> {
        let model = self.resolve_model(&request);
        let http_request = self.build_http_request(&request, &model, true)?;

        let response = self.transport.send_stream(http_request).await?;
        if !response.is_success() {
            let status = response.status;
            let retry_after = retry_after_from_headers(&response.headers);
            let text = response.collect_text().await?;
            return Err(self.dialect.map_error(self.id(), Some(status), &text, retry_after));
        }

        let dialect = Arc::clone(&self.dialect);
        let backend = self.config.id.clone();
        let stream_id = Uuid::new_v4().to_string();
        let estimated_prompt = self.estimator.estimate_request(&request).total as u64;
        let estimator = self.estimator.clone();
        let mut decoder = SseDecoder::new(response.body);

        let stream = async_stream::stream! {
            let mut content = String::new();
            let mut finish_reason: Option<FinishReason> = None;
            let mut usage = UsageDelta::default();
            let mut served_model = Some(model);

            loop {
                let event = match decoder.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(err)) => {
                        yield ChatChunk::failed(&stream_id, &backend, &err);
                        return;
                    }
                    None if finish_reason.is_some() => break,
                    None => {
                        let err = LLMError::StreamClosed {
                            message: format!("{backend} closed the stream before finishing"),
                        };
                        yield ChatChunk::failed(&stream_id, &backend, &err);
                        return;
                    }
                };

                let delta = match dialect.parse_stream_event(&backend, &event) {
                    Ok(delta) => delta,
                    Err(err) => {
                        debug!(backend = %backend, error = %err, "stream ended with an error event");
                        yield ChatChunk::failed(&stream_id, &backend, &err);
                        return;
                    }
                };
                if delta.model.is_some() {
                    served_model = delta.model;
                }
                usage.merge(delta.usage);
                if delta.finish_reason.is_some() {
                    finish_reason = delta.finish_reason;
                }
                if let Some(text) = delta.text.filter(|text| !text.is_empty()) {
                    content.push_str(&text);
                    let mut chunk = ChatChunk::delta(&stream_id, &backend, text);
                    chunk.model = served_model.clone();
                    yield chunk;
                }
                if delta.done {
                    break;
                }
            }

            let usage = TokenUsage::new(
                usage.prompt_tokens.unwrap_or(estimated_prompt),
                usage
                    .completion_tokens
                    .unwrap_or_else(|| estimator.estimate_text(&content) as u64),
            );
            debug!(backend = %backend, bytes = content.len(), "stream finished");
            let mut terminal = ChatChunk::terminal(
                &stream_id,
                &backend,
                finish_reason.unwrap_or(FinishReason::Stop),
                usage,
            );
            terminal.model = served_model;
            yield terminal;
        };

        Ok(Box::pin(stream))
    }

    /// Sends a one-token completion.
    async fn health_check(&self) -> bool {
        let probe = ChatRequest::new(self.id(), vec![Message::user("ping")])
            .with_max_tokens(1)
            .with_temperature(0.0);
        match self.chat(probe).await {
            Ok(_) => true,
            Err(err) => {
                debug!(backend = %self.id(), error = %err, "health check failed");
                false
            }
        }
    }

    fn optimize_prompt(
        &self,
        text: &str,
        context: Option<&ConversationContext>,
    ) -> PromptOptimization {
        optimize::optimize_prompt(
            text,
            context,
            self.dialect.prompt_profile(),
            &self.capabilities,
            &self.estimator,
        )
    }
}
