//! Astrolabe is a client library for tool-protocol servers: it connects a
//! chat model to external tools exposed over a child-process pipe or an
//! HTTP event stream, discovers each server's tool, prompt, and resource
//! catalogs, and runs the loop that turns model tool calls into server
//! invocations and folds the results back into the conversation.
//!
//! The crate emits `tracing` events; installing a subscriber is up to the
//! embedding application.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::adapter::{AdapterError, ToolAdapter};
pub use application::connection::{ConnectionError, ToolServerConnection};
pub use application::service::{ServiceError, ToolsService};
pub use config::{AppConfig, ConfigError, ModelHostConfig, RetryConfig, ServerEntry};
pub use domain::prompt::PromptBuilder;
pub use domain::tool::{
    CallToolResult, ContentPart, InputSchema, PromptInfo, ResourceInfo, ServerTool,
    ToolDefinition,
};
pub use domain::types::{ChatMessage, MessageRole};
pub use infrastructure::model::{
    HostConnection, ModelClient, ModelError, ModelTurn, ToolCallRequest,
};
pub use infrastructure::transport::{Transport, TransportError};
