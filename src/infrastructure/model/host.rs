use super::{ModelClient, ModelError, ModelTurn, ToolCallRequest};
use crate::domain::prompt::PromptBuilder;
use crate::domain::types::{ChatMessage, MessageRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Chat-completions client for an OpenAI-compatible model host (Ollama,
/// vLLM, hosted providers with a compatibility layer). The credential is
/// passed through as a bearer token and never interpreted.
pub struct HostConnection {
    credential: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl HostConnection {
    pub fn new(
        credential: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            credential: credential.into(),
            base_url: base_url.into(),
            model: model.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Embedding for a single input, using the connection's model.
    pub async fn embeddings(&self, input: &str) -> Result<Vec<f32>, ModelError> {
        let payload = EmbeddingRequest {
            model: &self.model,
            input: vec![input],
        };
        let response: EmbeddingResponse = self
            .http
            .post(self.endpoint("embeddings"))
            .bearer_auth(&self.credential)
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| ModelError::Network { source })?
            .json()
            .await
            .map_err(|source| ModelError::Network { source })?;

        response
            .data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .ok_or_else(|| ModelError::InvalidResponse {
                reason: "embedding response contained no data".to_string(),
            })
    }
}

#[async_trait]
impl ModelClient for HostConnection {
    async fn query(
        &self,
        prompt: &PromptBuilder,
        with_tools: bool,
    ) -> Result<ModelTurn, ModelError> {
        let (messages, tools) = prompt.build();
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            tools: if with_tools && !tools.is_empty() {
                Some(tools)
            } else {
                None
            },
            stream: false,
        };

        info!(
            model = %self.model,
            messages = messages.len(),
            with_tools,
            "Sending chat completion request"
        );
        let response: ChatCompletionResponse = self
            .http
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.credential)
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| ModelError::Network { source })?
            .json()
            .await
            .map_err(|source| ModelError::Network { source })?;
        debug!("Received chat completion response");

        turn_from_response(response)
    }
}

fn turn_from_response(response: ChatCompletionResponse) -> Result<ModelTurn, ModelError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::InvalidResponse {
            reason: "response contained no choices".to_string(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    Ok(ModelTurn {
        message: ChatMessage::new(
            MessageRole::Assistant,
            choice.message.content.unwrap_or_default(),
        ),
        tool_calls,
    })
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f32>,
}
