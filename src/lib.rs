//! 多后端 LLM 路由库
//!
//! Picks a backend per request, enforces per-backend rate limits, falls back across
//! backends on failure and normalizes blocking and streamed replies into one shape.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod ratelimit;
pub mod selector;
pub mod stream;
pub mod types;

pub use client::BackendPool;
pub use config::{BackendConfig, Credential, OrchestratorConfig, ProviderDeps, ProviderRegistry};
pub use context::{ContextBuilder, ContextRetrieval, ConversationContext};
pub use error::{ErrorKind, LLMError};
pub use orchestrator::{Orchestrator, ProcessOptions, StreamFallbackMode};
pub use provider::{ChatStream, DynProvider, HttpProvider, ProviderClient};
pub use types::*;
