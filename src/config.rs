use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::BackendPool;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::orchestrator::StreamFallbackMode;
use crate::provider::dialect::{AnthropicMessages, Dialect, GoogleGemini, OpenAiChat};
use crate::provider::{DynProvider, HttpProvider};
use crate::ratelimit::DynClock;
use crate::selector::ScoringWeights;
use crate::types::CapabilityDescriptor;

/// 后端配置 描述一个可调用后端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 自定义标识 例如 `openai-primary`
    pub id: String,
    /// 方言标识 例如 `openai_chat`
    pub dialect: String,
    #[serde(default)]
    pub credential: Credential,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rate_limits: Option<RateLimitOverride>,
    pub capabilities: Option<CapabilityOverride>,
    /// 单次 HTTP 请求超时
    pub timeout_ms: Option<u64>,
    /// 附加设置 例如 organization 或 anthropic version
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    /// 以默认值创建配置
    pub fn new(id: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dialect: dialect.into(),
            credential: Credential::None,
            base_url: None,
            default_model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            enabled: true,
            rate_limits: None,
            capabilities: None,
            timeout_ms: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_rate_limits(mut self, requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        self.rate_limits = Some(RateLimitOverride {
            requests_per_minute: Some(requests_per_minute),
            tokens_per_minute: Some(tokens_per_minute),
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 合并方言默认能力与配置覆盖 限流覆盖优先
    pub fn effective_capabilities(&self, defaults: CapabilityDescriptor) -> CapabilityDescriptor {
        let mut caps = match &self.capabilities {
            Some(overrides) => overrides.apply(defaults),
            None => defaults,
        };
        if let Some(limits) = &self.rate_limits {
            if let Some(rpm) = limits.requests_per_minute {
                caps.requests_per_minute = rpm;
            }
            if let Some(tpm) = limits.tokens_per_minute {
                caps.tokens_per_minute = tpm;
            }
        }
        caps
    }

    fn validate(&self) -> Result<(), LLMError> {
        if self.id.trim().is_empty() {
            return Err(invalid("backends[].id", "must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(invalid(
                format!("backends[{}].max_tokens", self.id),
                "must be greater than zero",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid(
                format!("backends[{}].temperature", self.id),
                "must be between 0.0 and 2.0",
            ));
        }
        if let Some(limits) = &self.rate_limits {
            if limits.requests_per_minute == Some(0) || limits.tokens_per_minute == Some(0) {
                return Err(invalid(
                    format!("backends[{}].rate_limits", self.id),
                    "limits must be greater than zero; disable the backend instead",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
}

/// 能力覆盖 仅替换给出的字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityOverride {
    pub max_context_tokens: Option<u32>,
    pub supports_streaming: Option<bool>,
    pub supports_system_messages: Option<bool>,
    pub input_price_per_token: Option<f64>,
    pub output_price_per_token: Option<f64>,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
    pub languages: Option<Vec<String>>,
    pub strengths: Option<Vec<String>>,
    pub weaknesses: Option<Vec<String>>,
}

impl CapabilityOverride {
    fn apply(&self, mut caps: CapabilityDescriptor) -> CapabilityDescriptor {
        if let Some(value) = self.max_context_tokens {
            caps.max_context_tokens = value;
        }
        if let Some(value) = self.supports_streaming {
            caps.supports_streaming = value;
        }
        if let Some(value) = self.supports_system_messages {
            caps.supports_system_messages = value;
        }
        if let Some(value) = self.input_price_per_token {
            caps.input_price_per_token = value;
        }
        if let Some(value) = self.output_price_per_token {
            caps.output_price_per_token = value;
        }
        if let Some(value) = self.requests_per_minute {
            caps.requests_per_minute = value;
        }
        if let Some(value) = self.tokens_per_minute {
            caps.tokens_per_minute = value;
        }
        if let Some(value) = &self.languages {
            caps.languages = value.clone();
        }
        if let Some(value) = &self.strengths {
            caps.strengths = value.clone();
        }
        if let Some(value) = &self.weaknesses {
            caps.weaknesses = value.clone();
        }
        caps
    }
}

/// 鉴权信息
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key
    ApiKey {
        /// header 名称 留空时按方言默认
        header: Option<String>,
        key: String,
    },
    /// Bearer Token
    Bearer { token: String },
    /// 无需鉴权的本地后端
    #[default]
    None,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiKey { header, .. } => f
                .debug_struct("ApiKey")
                .field("header", header)
                .field("key", &"<redacted>")
                .finish(),
            Credential::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
            Credential::None => f.write_str("None"),
        }
    }
}

/// 编排器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 未指定偏好时使用的后端
    pub default_backend: Option<String>,
    /// 回退顺序 为空时按注册顺序
    pub fallback_order: Vec<String>,
    pub max_retries: u32,
    pub weights: ScoringWeights,
    pub stream_fallback_mode: StreamFallbackMode,
    pub history_limit: usize,
    pub context_retrieval_limit: usize,
    pub backends: Vec<BackendConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            fallback_order: Vec::new(),
            max_retries: 3,
            weights: ScoringWeights::default(),
            stream_fallback_mode: StreamFallbackMode::default(),
            history_limit: crate::context::DEFAULT_HISTORY_LIMIT,
            context_retrieval_limit: 5,
            backends: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// 从 JSON 文本解析并校验
    pub fn from_json_str(json: &str) -> Result<Self, LLMError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| invalid("config", format!("malformed JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件读取
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LLMError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| invalid("config", format!("cannot read {}: {err}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// 校验标识唯一 以及引用的后端存在
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }
        let mut seen = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            backend.validate()?;
            if seen.contains(&backend.id.as_str()) {
                return Err(invalid(
                    "backends[].id",
                    format!("duplicate backend id {}", backend.id),
                ));
            }
            seen.push(backend.id.as_str());
        }
        let references = self
            .default_backend
            .iter()
            .map(|id| ("default_backend", id))
            .chain(self.fallback_order.iter().map(|id| ("fallback_order", id)));
        for (field, id) in references {
            if !seen.contains(&id.as_str()) {
                return Err(invalid(field, format!("unknown backend {id}")));
            }
        }
        Ok(())
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> LLMError {
    LLMError::InvalidConfig {
        field: field.into(),
        reason: reason.into(),
    }
}

/// 构造后端时共享的依赖
#[derive(Clone)]
pub struct ProviderDeps {
    pub transport: DynHttpTransport,
    pub clock: DynClock,
}

/// 方言构造函数
pub type ProviderConstructor =
    Arc<dyn Fn(&BackendConfig, &ProviderDeps) -> Result<DynProvider, LLMError> + Send + Sync>;

/// 方言注册表 方言标识到构造函数的映射
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("dialects", &names)
            .finish()
    }
}

fn http_constructor<D: Dialect + Default + 'static>() -> ProviderConstructor {
    Arc::new(|config: &BackendConfig, deps: &ProviderDeps| {
        let provider = HttpProvider::new(
            config.clone(),
            Arc::new(D::default()),
            deps.transport.clone(),
            deps.clock.clone(),
        )?;
        Ok(Arc::new(provider) as DynProvider)
    })
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置方言 `openai_chat` `anthropic_messages` `google_gemini`
    pub fn with_builtin_dialects() -> Self {
        Self::new()
            .register(OpenAiChat.name(), http_constructor::<OpenAiChat>())
            .register(AnthropicMessages.name(), http_constructor::<AnthropicMessages>())
            .register(GoogleGemini.name(), http_constructor::<GoogleGemini>())
    }

    /// 注册或替换一个方言
    pub fn register(mut self, dialect: impl Into<String>, constructor: ProviderConstructor) -> Self {
        self.constructors.insert(dialect.into(), constructor);
        self
    }

    pub fn dialects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, config: &BackendConfig, deps: &ProviderDeps) -> Result<DynProvider, LLMError> {
        let constructor = self.constructors.get(&config.dialect).ok_or_else(|| {
            invalid(
                format!("backends[{}].dialect", config.id),
                format!("unknown dialect {}", config.dialect),
            )
        })?;
        constructor(config, deps)
    }

    /// 按配置顺序构建后端池
    pub fn build_pool(
        &self,
        configs: &[BackendConfig],
        deps: &ProviderDeps,
    ) -> Result<BackendPool, LLMError> {
        let mut builder = BackendPool::builder();
        for config in configs {
            builder = builder.register(self.build(config, deps)?);
        }
        builder.build()
    }
}
