use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;

use crate::config::BackendConfig;
use crate::context::ConversationContext;
use crate::error::LLMError;
use crate::ratelimit::RateLimitTracker;
use crate::types::{
    CapabilityDescriptor, ChatChunk, ChatRequest, ChatResponse, PromptOptimization, ProviderType,
    TokenEstimator,
};

pub mod adapter;
pub mod dialect;
pub mod optimize;

pub use adapter::HttpProvider;

/// 流式响应别名 失败以终止错误块表示
pub type ChatStream = Pin<Box<dyn Stream<Item = ChatChunk> + Send>>;

/// 统一的后端接口 所有后端实现该接口即可被编排器调度
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// 后端标识
    fn id(&self) -> &str;

    fn config(&self) -> &BackendConfig;

    /// 描述能力与价格
    fn capabilities(&self) -> &CapabilityDescriptor;

    /// 本后端独占的限流窗口
    fn rate_limiter(&self) -> &RateLimitTracker;

    /// 提交完整请求并等待完整响应
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError>;

    /// 以流式方式返回增量块
    ///
    /// 打开失败返回 `Err` 打开后的失败以终止错误块结束流
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LLMError>;

    /// 低成本探活
    async fn health_check(&self) -> bool;

    /// 分词估算族
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    /// 估算单次请求费用 (USD)
    ///
    /// Completion tokens are priced at the request's `max_tokens`, so this is an upper bound.
    fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        let caps = self.capabilities();
        let prompt_tokens = TokenEstimator::new(self.provider_type())
            .estimate_request(request)
            .total as f64;
        prompt_tokens * caps.input_price_per_token
            + f64::from(request.max_tokens) * caps.output_price_per_token
    }

    /// 按后端偏好改写提示词
    fn optimize_prompt(
        &self,
        text: &str,
        _context: Option<&ConversationContext>,
    ) -> PromptOptimization {
        PromptOptimization::unchanged(text)
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// 当前窗口是否还能接收请求
    fn can_admit(&self) -> bool {
        self.rate_limiter().can_admit()
    }

    /// 记录一次已发出的请求
    fn record_usage(&self, tokens: u64) {
        self.rate_limiter().record_usage(tokens);
    }
}

/// 线程安全 Provider
pub type DynProvider = Arc<dyn ProviderClient>;
