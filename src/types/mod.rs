//! Core type definitions: messages, requests, streaming events, tools and
//! usage records.

pub mod chat;
pub mod events;
pub mod message;
pub mod tool;
pub mod usage;

pub use chat::{ChatOptions, ChatRequest, ChatResponse};
pub use events::{ChatDelta, TokenUsage};
pub use message::{Message, MessageRole};
pub use tool::{ToolCall, ToolDefinition, ToolInvoker, ToolResult};
pub use usage::{UsageRecord, UsageStatus};
