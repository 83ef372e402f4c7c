//! The model-client seam. The tools service only needs something that
//! turns a prompt into a turn which may propose tool calls; the bundled
//! [`HostConnection`] speaks the OpenAI-compatible chat-completions API.

mod host;

pub use host::HostConnection;

use crate::domain::prompt::PromptBuilder;
use crate::domain::types::ChatMessage;
use async_trait::async_trait;
use thiserror::Error;

/// One assistant turn: the message plus any tool calls it proposed.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub message: ChatMessage,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// A tool call proposed by the model. Arguments stay JSON-encoded the way
/// the model produced them; decoding happens at validation time.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error calling model host: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
    },
    #[error("model host returned an invalid response: {reason}")]
    InvalidResponse { reason: String },
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Queries the model with the prompt's messages; when `with_tools` is
    /// set the prompt's registered tools are advertised alongside.
    async fn query(
        &self,
        prompt: &PromptBuilder,
        with_tools: bool,
    ) -> Result<ModelTurn, ModelError>;
}
