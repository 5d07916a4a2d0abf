//! Oxibot Core — shared types, message bus, session store, and configuration.
//!
//! This crate has no knowledge of specific LLM providers, channels, or
//! tools; it is the substrate the other crates build on.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;
pub mod webhook;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use session::SessionManager;
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ContentPart, FunctionCall, FunctionDefinition,
    ImageUrl, LlmResponse, MediaAttachment, Message, MessageContent, Session, TaskItem,
    TaskStatus, ToolAction, ToolCall, ToolDefinition, UsageInfo,
};
pub use webhook::WebhookEmitter;
