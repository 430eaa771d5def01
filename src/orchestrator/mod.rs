//! Request routing across backends.
//!
//! An [`Orchestrator`] builds the conversation context, picks a backend with the
//! [`ModelSelector`], then walks the fallback chain until one backend serves the request.
//! Rate-limit and metrics state is owned per instance, so several orchestrators can live
//! side by side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::BackendPool;
use crate::config::{OrchestratorConfig, ProviderDeps, ProviderRegistry};
use crate::context::{
    ContextBuilder, ConversationContext, DEFAULT_HISTORY_LIMIT, DynContextRetrieval,
    max_tokens_for_timeout, system_prompt,
};
use crate::error::LLMError;
use crate::http::reqwest::default_dyn_transport;
use crate::metrics::{BackendMetrics, PerformanceMetrics};
use crate::provider::optimize;
use crate::ratelimit::SystemClock;
use crate::selector::{Candidate, ModelSelector, ScoredCandidate, ScoringWeights};
use crate::types::{AppliedTransform, ChatRequest, ChatResponse, ModelSwitchEvent, SwitchReason};

mod analytics;
mod chain;
mod options;
mod stream;

pub use analytics::{BackendAnalytics, BackendStatus, PerformanceAnalytics, SwitchSummary};
pub use options::{ProcessOptions, StreamFallbackMode};

use chain::{AttemptPlan, build_chain, no_backend_available};

/// Backend id stamped on stream error chunks raised before any backend could be named.
pub const UNROUTED_BACKEND: &str = "unrouted";

/// Routes requests across a [`BackendPool`]. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    pool: BackendPool,
    metrics: PerformanceMetrics,
    selector: ModelSelector,
    context_builder: ContextBuilder,
    default_backend: Option<String>,
    fallback_order: Vec<String>,
    max_retries: u32,
    stream_fallback_mode: StreamFallbackMode,
    context_retrieval_limit: usize,
    switch_history: Mutex<Vec<ModelSwitchEvent>>,
    /// Conversation key to the backend that served it last.
    active_backends: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pool", &self.inner.pool)
            .field("default_backend", &self.inner.default_backend)
            .field("fallback_order", &self.inner.fallback_order)
            .field("max_retries", &self.inner.max_retries)
            .finish_non_exhaustive()
    }
}

/// Everything a call needs once context, selection and prompt shaping are done.
pub(crate) struct PreparedCall {
    request: ChatRequest,
    preferred: Option<String>,
    selected: String,
    chain: Vec<String>,
    max_attempts: u32,
    optimizations: Vec<AppliedTransform>,
    conversation_key: String,
    conversation_id: Option<String>,
    branch_id: String,
    started: Instant,
}

fn conversation_key(conversation_id: Option<&str>, branch_id: &str) -> String {
    match conversation_id.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => branch_id.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    pub fn builder(pool: BackendPool) -> OrchestratorBuilder {
        OrchestratorBuilder::new(pool)
    }

    /// Builds the backends from `config` with the built-in dialects, the reqwest transport
    /// and the system clock.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, LLMError> {
        let deps = ProviderDeps {
            transport: default_dyn_transport()?,
            clock: Arc::new(SystemClock),
        };
        Self::from_config_with(config, &ProviderRegistry::with_builtin_dialects(), &deps)
    }

    /// Same as [`Orchestrator::from_config`] with caller-supplied dialects and dependencies.
    pub fn from_config_with(
        config: &OrchestratorConfig,
        registry: &ProviderRegistry,
        deps: &ProviderDeps,
    ) -> Result<Self, LLMError> {
        config.validate()?;
        let pool = registry.build_pool(&config.backends, deps)?;
        let mut builder = Self::builder(pool)
            .fallback_order(config.fallback_order.clone())
            .max_retries(config.max_retries)
            .weights(config.weights.clone())
            .stream_fallback_mode(config.stream_fallback_mode)
            .history_limit(config.history_limit)
            .context_retrieval_limit(config.context_retrieval_limit);
        if let Some(default_backend) = &config.default_backend {
            builder = builder.default_backend(default_backend.clone());
        }
        builder.build()
    }

    pub fn pool(&self) -> &BackendPool {
        &self.inner.pool
    }

    pub fn stream_fallback_mode(&self) -> StreamFallbackMode {
        self.inner.stream_fallback_mode
    }

    pub fn metrics(&self, backend: &str) -> BackendMetrics {
        self.inner.metrics.get(backend)
    }

    /// Backend that served (or was switched to for) the conversation most recently.
    pub fn active_backend(&self, conversation_id: Option<&str>, branch_id: &str) -> Option<String> {
        let key = conversation_key(conversation_id, branch_id);
        lock(&self.inner.active_backends).get(&key).cloned()
    }

    /// Recorded switches, oldest first.
    pub fn switch_history(&self) -> Vec<ModelSwitchEvent> {
        lock(&self.inner.switch_history).clone()
    }

    fn candidates(&self) -> Vec<Candidate<'_>> {
        self.inner
            .pool
            .iter()
            .map(|backend| Candidate {
                id: backend.id(),
                enabled: backend.is_enabled(),
                admissible: backend.can_admit(),
                capabilities: backend.capabilities(),
                metrics: self.inner.metrics.get(backend.id()),
            })
            .collect()
    }

    /// Selector scores for `request_text` in registration order.
    pub fn rank_backends(&self, request_text: &str, preferred: Option<&str>) -> Vec<ScoredCandidate> {
        self.inner
            .selector
            .rank(request_text, preferred, &self.candidates())
    }

    /// Context build, selection, prompt optimization and request construction.
    pub(crate) async fn prepare(
        &self,
        content: &str,
        branch_id: &str,
        preferred: Option<&str>,
        context: Option<ConversationContext>,
        options: &ProcessOptions,
    ) -> Result<PreparedCall, LLMError> {
        let started = Instant::now();
        let inner = &self.inner;
        if content.trim().is_empty() {
            return Err(LLMError::Validation {
                message: "request content is empty".to_string(),
            });
        }

        let mut context = context.unwrap_or_else(|| ConversationContext::new(branch_id));
        context.branch_id = branch_id.to_string();
        let key = conversation_key(context.conversation_id.as_deref(), branch_id);

        let preferred = preferred
            .map(str::to_string)
            .or_else(|| options.preferred_backend.clone())
            .or_else(|| lock(&inner.active_backends).get(&key).cloned())
            .or_else(|| inner.default_backend.clone());
        if let Some(id) = &preferred {
            inner.pool.require(id)?;
        }
        for id in &options.fallback_backends {
            inner.pool.require(id)?;
        }

        if options.enable_context_retrieval {
            let limit = options
                .context_retrieval_limit
                .unwrap_or(inner.context_retrieval_limit);
            context = inner.context_builder.enrich(content, context, limit).await;
        }

        let selected = inner
            .selector
            .select(content, preferred.as_deref(), &self.candidates())
            .ok_or_else(|| {
                let all: Vec<String> = inner.pool.ids().into_iter().map(str::to_string).collect();
                no_backend_available(&inner.pool, &all)
            })?;
        let backend = inner.pool.require(&selected)?;

        let (text, optimizations) = if options.optimize_prompts {
            let optimized = backend.optimize_prompt(content, Some(&context));
            (optimized.optimized_text, optimized.applied)
        } else {
            (content.to_string(), Vec::new())
        };

        let max_tokens = max_tokens_for_timeout(backend.config().max_tokens, options.timeout_ms);
        let mut request = inner.context_builder.build_request(
            &selected,
            &text,
            &context,
            max_tokens,
            backend.config().temperature,
        );
        if optimizations.iter().any(|t| t.name == optimize::CONTEXT_SUMMARY) {
            request.system_prompt = system_prompt(&context, false);
        }

        let fallback: Vec<String> = if !options.fallback_backends.is_empty() {
            options.fallback_backends.clone()
        } else if !inner.fallback_order.is_empty() {
            inner.fallback_order.clone()
        } else {
            inner.pool.ids().into_iter().map(str::to_string).collect()
        };
        let chain = build_chain(&selected, &fallback);
        debug!(
            selected = %selected,
            preferred = ?preferred,
            chain = ?chain,
            "backend selected"
        );

        Ok(PreparedCall {
            request,
            preferred,
            selected,
            chain,
            max_attempts: options.max_retries.unwrap_or(inner.max_retries),
            optimizations,
            conversation_key: key,
            conversation_id: context.conversation_id,
            branch_id: branch_id.to_string(),
            started,
        })
    }

    /// Sends `content` to the best available backend, falling back along the chain.
    ///
    /// # Errors
    ///
    /// * [`LLMError::NoBackendAvailable`] when no enabled, admissible backend exists. No
    ///   backend is called in that case.
    /// * [`LLMError::AllBackendsFailed`] when every attempt failed.
    /// * The backend's own error for content-level failures (`invalid_request`,
    ///   `content_filter`), which no other backend would fix.
    pub async fn process(
        &self,
        content: &str,
        branch_id: &str,
        preferred: Option<&str>,
        context: Option<ConversationContext>,
        options: ProcessOptions,
    ) -> Result<ChatResponse, LLMError> {
        let prepared = self
            .prepare(content, branch_id, preferred, context, &options)
            .await?;
        let inner = &self.inner;
        let mut plan = AttemptPlan::new(prepared.chain.clone(), prepared.max_attempts);

        loop {
            let dispatch = plan.next(&inner.pool)?;
            let backend = dispatch.backend;
            let id = backend.id().to_string();
            if let Some(wait) = dispatch.backoff {
                debug!(backend = %id, wait_ms = wait.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(wait).await;
            }

            let attempt_started = Instant::now();
            let result = backend.chat(prepared.request.retarget(&id)).await;
            let latency = attempt_started.elapsed();

            match result {
                Ok(mut response) => {
                    let tokens = response.usage.total_tokens;
                    backend.record_usage(tokens);
                    inner.metrics.record_success(&id, latency, tokens);

                    response.backend = id.clone();
                    response.optimizations = prepared.optimizations.clone();
                    response.processing_time_ms = prepared.started.elapsed().as_millis() as u64;
                    response.switch_event = self.finish_turn(&prepared, &id);
                    info!(
                        backend = %id,
                        attempt = dispatch.attempt,
                        latency_ms = latency.as_millis() as u64,
                        tokens,
                        "request served"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    backend.record_usage(0);
                    inner.metrics.record_failure(&id, latency);
                    warn!(
                        backend = %id,
                        attempt = dispatch.attempt,
                        kind = %err.kind(),
                        error = %err,
                        "attempt failed"
                    );
                    plan.failed(&id, err)?;
                }
            }
        }
    }

    /// Marks `serving` active for the conversation and records a switch event when it
    /// differs from the preferred backend, or from the selected one when nothing was preferred.
    pub(crate) fn finish_turn(&self, prepared: &PreparedCall, serving: &str) -> Option<ModelSwitchEvent> {
        lock(&self.inner.active_backends)
            .insert(prepared.conversation_key.clone(), serving.to_string());

        let origin = prepared.preferred.as_deref().unwrap_or(prepared.selected.as_str());
        if origin == serving {
            return None;
        }
        let reason = if serving != prepared.selected {
            SwitchReason::Fallback
        } else {
            SwitchReason::Optimization
        };
        let event = ModelSwitchEvent {
            id: Uuid::new_v4().to_string(),
            from: Some(origin.to_string()),
            to: serving.to_string(),
            reason,
            conversation_id: prepared.conversation_id.clone(),
            branch_id: Some(prepared.branch_id.clone()),
            timestamp: Utc::now(),
            context_preserved: true,
            switch_latency_ms: prepared.started.elapsed().as_millis() as u64,
        };
        info!(from = %origin, to = %serving, reason = ?reason, "backend switched");
        lock(&self.inner.switch_history).push(event.clone());
        Some(event)
    }

    /// Explicitly moves a conversation onto `new_backend`.
    ///
    /// Later calls for the same conversation prefer that backend until another switch.
    pub fn switch_backend(
        &self,
        new_backend: &str,
        conversation_id: &str,
        branch_id: &str,
        context: Option<&ConversationContext>,
        reason: SwitchReason,
    ) -> Result<ModelSwitchEvent, LLMError> {
        let started = Instant::now();
        let backend = self.inner.pool.require(new_backend)?;
        if !backend.is_enabled() {
            return Err(LLMError::Validation {
                message: format!("backend {new_backend} is disabled"),
            });
        }

        let key = conversation_key(Some(conversation_id), branch_id);
        let from = lock(&self.inner.active_backends).insert(key, new_backend.to_string());
        let event = ModelSwitchEvent {
            id: Uuid::new_v4().to_string(),
            from,
            to: new_backend.to_string(),
            reason,
            conversation_id: Some(conversation_id.to_string()).filter(|id| !id.is_empty()),
            branch_id: Some(branch_id.to_string()),
            timestamp: Utc::now(),
            context_preserved: context.is_some(),
            switch_latency_ms: started.elapsed().as_millis() as u64,
        };
        info!(from = ?event.from, to = %new_backend, reason = ?reason, "backend switched on request");
        lock(&self.inner.switch_history).push(event.clone());
        Ok(event)
    }

    /// Per-backend health, latency, error rate and rate-limit snapshot, in registration order.
    pub fn backends_status(&self) -> Vec<BackendStatus> {
        self.inner
            .pool
            .iter()
            .map(|backend| BackendStatus::new(backend, &self.inner.metrics.get(backend.id())))
            .collect()
    }

    /// Runs every enabled backend's health probe, one after another.
    pub async fn probe_backends(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();
        for backend in self.inner.pool.iter().filter(|backend| backend.is_enabled()) {
            let healthy = backend.health_check().await;
            results.push((backend.id().to_string(), healthy));
        }
        results
    }

    /// Derived metrics, a switch-history summary and plain-language recommendations.
    pub fn performance_analytics(&self) -> PerformanceAnalytics {
        let snapshot = self
            .inner
            .pool
            .iter()
            .map(|backend| (backend.id().to_string(), self.inner.metrics.get(backend.id())))
            .collect();
        let backends = analytics::backend_analytics(snapshot);
        let switches = analytics::summarize_switches(&lock(&self.inner.switch_history));
        let recommendations = analytics::recommendations(&backends, &switches);
        PerformanceAnalytics {
            backends,
            switches,
            recommendations,
        }
    }
}

/// Assembles an [`Orchestrator`] around a backend pool.
pub struct OrchestratorBuilder {
    pool: BackendPool,
    default_backend: Option<String>,
    fallback_order: Vec<String>,
    max_retries: u32,
    weights: ScoringWeights,
    stream_fallback_mode: StreamFallbackMode,
    history_limit: usize,
    context_retrieval_limit: usize,
    retrieval: Option<DynContextRetrieval>,
}

impl OrchestratorBuilder {
    fn new(pool: BackendPool) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            pool,
            default_backend: None,
            fallback_order: Vec::new(),
            max_retries: defaults.max_retries,
            weights: ScoringWeights::default(),
            stream_fallback_mode: StreamFallbackMode::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            context_retrieval_limit: defaults.context_retrieval_limit,
            retrieval: None,
        }
    }

    pub fn default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    pub fn fallback_order(mut self, order: Vec<String>) -> Self {
        self.fallback_order = order;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn stream_fallback_mode(mut self, mode: StreamFallbackMode) -> Self {
        self.stream_fallback_mode = mode;
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn context_retrieval_limit(mut self, limit: usize) -> Self {
        self.context_retrieval_limit = limit;
        self
    }

    pub fn retrieval(mut self, retrieval: DynContextRetrieval) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Checks that every referenced backend is registered.
    pub fn build(self) -> Result<Orchestrator, LLMError> {
        if self.max_retries == 0 {
            return Err(LLMError::InvalidConfig {
                field: "max_retries".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let references = self
            .default_backend
            .iter()
            .map(|id| ("default_backend", id))
            .chain(self.fallback_order.iter().map(|id| ("fallback_order", id)));
        for (field, id) in references {
            if !self.pool.contains(id) {
                return Err(LLMError::InvalidConfig {
                    field: field.to_string(),
                    reason: format!("unknown backend {id}"),
                });
            }
        }

        let mut context_builder = ContextBuilder::new(self.history_limit);
        if let Some(retrieval) = self.retrieval {
            context_builder = context_builder.with_retrieval(retrieval);
        }
        let metrics = PerformanceMetrics::new(self.pool.ids());

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                metrics,
                selector: ModelSelector::new(self.weights),
                context_builder,
                default_backend: self.default_backend,
                fallback_order: self.fallback_order,
                max_retries: self.max_retries,
                stream_fallback_mode: self.stream_fallback_mode,
                context_retrieval_limit: self.context_retrieval_limit,
                switch_history: Mutex::new(Vec::new()),
                active_backends: Mutex::new(HashMap::new()),
                pool: self.pool,
            }),
        })
    }
}
