//! mux-protocol: Shared types for llmux.
//!
//! This crate defines the conversation model handed to provider adapters and
//! the normalized events and final message they hand back.

pub mod context;
pub mod message;

pub use context::{
    CacheHint, Context, ConversationMessage, ImageData, Role, ToolDefinition, ToolResultRecord,
    ToolUseRecord,
};
pub use message::{AssistantMessage, ContentBlock, StopReason, StreamError, StreamEvent, Usage};
