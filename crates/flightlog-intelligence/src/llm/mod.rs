//! Typed client for the remote chat and embeddings provider.

pub mod gateway;
pub mod types;

pub use gateway::{ChatBackend, LlmGateway};
pub use types::{
    ChatMessage, ChatOutcome, FunctionCall, FunctionSpec, ToolCallRequest, ToolChoice,
    ToolDefinition,
};
