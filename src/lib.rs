//! # modelgate
//!
//! 模型网关中间件：在应用代码与远程文本生成后端之间提供弹性客户端工厂与请求流水线。
//!
//! Resilient client middleware for chat-style model backends. modelgate
//! turns a map of named, externally configured backends into lazily built,
//! cached clients and wraps every call — unary or streaming — with a fixed,
//! composable chain of cross-cutting layers.
//!
//! ## Overview
//!
//! - **Lazy, build-once clients**: [`ClientFactory`] realizes one pipeline
//!   per configured name on first access; concurrent first callers collapse
//!   to a single build, and refresh or configuration change evicts handles
//!   for rebuild.
//! - **Fixed layer order**: Retry → RateLimit → Logging → Audit → Cache →
//!   Usage → Safety → ToolLoop → Backend. Each layer is independently
//!   togglable; disabling one never reorders the rest.
//! - **Health-checked fallback**: TTL-cached probes let
//!   [`ClientFactory::client_with_fallback`] skip unhealthy candidates
//!   without building them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modelgate::{ClientFactory, PipelineDeps, GatewayConfig, ChatRequest, Message, ChatHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> modelgate::Result<()> {
//!     let config = GatewayConfig::from_yaml_file("gateway.yaml")?;
//!     let factory = ClientFactory::new(config, PipelineDeps::in_memory());
//!
//!     let client = factory.client("openai-main").await?;
//!     let request = ChatRequest::new(vec![Message::user("Hello!")]);
//!     let response = client.chat(request, CancellationToken::new()).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`factory`] | Lazy client registry, health checks, fallback |
//! | [`pipeline`] | Layer contract, canonical order, the eight layers |
//! | [`backend`] | HTTP backend adapter (OpenAI-compatible wire format) |
//! | [`config`] | Configuration snapshots, YAML loading, hot reload |
//! | [`store`] | Storage collaborator seams + in-memory implementations |
//! | [`cache`] | Exact cache keys, semantic matcher, cache statistics |
//! | [`tokens`] | Token estimation heuristics and price tables |
//! | [`resilience`] | Circuit breaker |
//! | [`types`] | Messages, requests, streaming events, usage records |

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod pipeline;
pub mod resilience;
pub mod store;
pub mod tokens;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream of fallible items.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

pub use error::{Error, ErrorContext};

// Re-export the main types for convenience.
pub use config::{ClientConfig, ConfigWatcher, GatewayConfig, PipelineConfig, SafetyPolicy};
pub use factory::{ClientFactory, HealthStatus, ModelClient};
pub use pipeline::{ChatHandler, DeltaStream, LayerKind, Pipeline, PipelineDeps};
pub use types::{
    ChatDelta, ChatOptions, ChatRequest, ChatResponse, Message, MessageRole, TokenUsage, ToolCall,
    ToolDefinition, ToolInvoker, ToolResult, UsageRecord, UsageStatus,
};
