use serde::{Deserialize, Serialize};

/// How a restarted generation is presented after a mid-stream fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFallbackMode {
    /// The first chunk from the new backend carries `restart = true` when partial content
    /// was already delivered, so callers can discard what they rendered.
    #[default]
    Replace,
    /// Chunks from the new backend are forwarded without a marker.
    Append,
}

/// Per-call knobs for `process` and `stream_process`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Overrides the configured default backend.
    pub preferred_backend: Option<String>,
    /// Overrides the configured fallback order.
    pub fallback_backends: Vec<String>,
    /// Total attempts across the chain; the orchestrator default applies when `None`.
    pub max_retries: Option<u32>,
    /// Advisory budget that caps the requested max tokens.
    pub timeout_ms: Option<u64>,
    pub enable_context_retrieval: bool,
    pub context_retrieval_limit: Option<usize>,
    pub optimize_prompts: bool,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferred_backend(mut self, backend: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend.into());
        self
    }

    pub fn with_fallback_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_backends = backends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_context_retrieval(mut self, limit: usize) -> Self {
        self.enable_context_retrieval = true;
        self.context_retrieval_limit = Some(limit);
        self
    }

    pub fn with_prompt_optimization(mut self) -> Self {
        self.optimize_prompts = true;
        self
    }
}
