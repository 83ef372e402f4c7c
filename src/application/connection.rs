use crate::application::adapter::{AdapterError, ToolAdapter};
use crate::domain::tool::{
    CallToolResult, ContentPart, PromptInfo, ResourceInfo, ServerTool, ToolDefinition,
};
use crate::infrastructure::transport::{RpcSession, Transport, TransportError};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const DEFAULT_CLIENT_NAME: &str = "default-client";
const DEFAULT_CLIENT_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("tool server '{server}' exposes no tools, prompts, or resources")]
    EmptyServer { server: String },
    #[error("connection '{server}' has not been established")]
    NotConnected { server: String },
    #[error("tool call response could not be decoded: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
}

/// One connected tool server: owns the transport, the protocol session,
/// and the three capability catalogs discovered at connect time. Each
/// catalog is either populated (possibly empty) or absent when its listing
/// call failed.
pub struct ToolServerConnection {
    transport: Transport,
    client_name: String,
    client_version: String,
    session: Option<Arc<dyn RpcSession>>,
    tools: Option<Vec<ServerTool>>,
    prompts: Option<Vec<PromptInfo>>,
    resources: Option<Vec<ResourceInfo>>,
    instructions: Option<String>,
    adapter: ToolAdapter,
}

impl ToolServerConnection {
    pub fn new(transport: Transport) -> Self {
        Self::with_identity(transport, DEFAULT_CLIENT_NAME, DEFAULT_CLIENT_VERSION)
    }

    pub fn with_identity(
        transport: Transport,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            client_name: client_name.into(),
            client_version: client_version.into(),
            session: None,
            tools: None,
            prompts: None,
            resources: None,
            instructions: None,
            adapter: ToolAdapter::new(),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// Identity key used by the service registry.
    pub fn registry_key(&self) -> String {
        format!("{}/v{}", self.client_name, self.client_version)
    }

    pub fn tools(&self) -> Option<&[ServerTool]> {
        self.tools.as_deref()
    }

    pub fn prompts(&self) -> Option<&[PromptInfo]> {
        self.prompts.as_deref()
    }

    pub fn resources(&self) -> Option<&[ResourceInfo]> {
        self.resources.as_deref()
    }

    /// Usage guidance the server returned from the handshake, if any.
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Performs the handshake and discovers the server's catalogs. Fails
    /// with [`ConnectionError::EmptyServer`] when all three end up
    /// absent or empty.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let session: Arc<dyn RpcSession> = self.transport.acquire().await?;
        self.connect_with(session).await
    }

    pub(crate) async fn connect_with(
        &mut self,
        session: Arc<dyn RpcSession>,
    ) -> Result<(), ConnectionError> {
        self.handshake(session.as_ref()).await?;
        self.tools = self.list_tools(session.as_ref()).await;
        self.prompts = self.list_prompts(session.as_ref()).await;
        self.resources = self.list_resources(session.as_ref()).await;

        let all_empty = self.tools.as_deref().is_none_or(<[_]>::is_empty)
            && self.prompts.as_deref().is_none_or(<[_]>::is_empty)
            && self.resources.as_deref().is_none_or(<[_]>::is_empty);
        if all_empty {
            return Err(ConnectionError::EmptyServer {
                server: self.registry_key(),
            });
        }
        // Only a validated connect leaves the connection usable.
        self.session = Some(session);
        Ok(())
    }

    /// Closes the transport. Catalogs keep their last discovered state.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.session = None;
        self.transport.close().await?;
        Ok(())
    }

    /// Invokes the named tool with the given arguments (empty mapping when
    /// none are supplied). No retry: transport failures propagate.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, ConnectionError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ConnectionError::NotConnected {
                server: self.registry_key(),
            })?;
        let arguments = arguments.unwrap_or_default();
        let result = session
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        serde_json::from_value(result).map_err(|source| ConnectionError::Decode { source })
    }

    /// The discovered tool catalog in the canonical dialect; absent when
    /// the catalog itself is absent.
    pub fn tool_definitions(&self) -> Result<Option<Vec<ToolDefinition>>, AdapterError> {
        let Some(tools) = &self.tools else {
            return Ok(None);
        };
        let definitions = tools
            .iter()
            .map(|tool| self.adapter.server_tool_to_definition(tool))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(definitions))
    }

    /// Concatenates all text content parts with newline separators;
    /// non-text parts contribute empty strings.
    pub fn extract_text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.as_str(),
                _ => "",
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Fixed-shape rendering handed back to the model. The text is
    /// interpolated without escaping; consumers rely on this exact shape.
    pub fn extract_text_for_llm(tool_name: &str, result: &CallToolResult) -> String {
        let text = Self::extract_text(result);
        format!("{{\"type\": \"tool_result\",\"tool_name\": \"{tool_name}\",\"result\": \"{text}\"}}")
    }

    async fn handshake(&mut self, session: &dyn RpcSession) -> Result<(), ConnectionError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version,
            },
            "capabilities": {}
        });
        let result = session.request("initialize", params).await?;
        if let Some(text) = result.get("instructions").and_then(Value::as_str) {
            self.instructions = Some(text.to_string());
        }
        session.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    async fn list_tools(&self, session: &dyn RpcSession) -> Option<Vec<ServerTool>> {
        let result = match session.request("tools/list", json!({})).await {
            Ok(result) => result,
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "tools listing failed");
                return None;
            }
        };
        let Some(raw) = result.get("tools").cloned() else {
            return Some(Vec::new());
        };
        match serde_json::from_value::<Vec<ServerTool>>(raw) {
            Ok(tools) => {
                for tool in &tools {
                    info!(
                        server = %self.registry_key(),
                        tool = %tool.name,
                        "Connected to server with tool"
                    );
                }
                Some(tools)
            }
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "tool catalog could not be decoded");
                None
            }
        }
    }

    async fn list_prompts(&self, session: &dyn RpcSession) -> Option<Vec<PromptInfo>> {
        let result = match session.request("prompts/list", json!({})).await {
            Ok(result) => result,
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "prompts listing failed");
                return None;
            }
        };
        let Some(raw) = result.get("prompts").cloned() else {
            return Some(Vec::new());
        };
        match serde_json::from_value::<Vec<PromptInfo>>(raw) {
            Ok(prompts) => {
                if prompts.is_empty() {
                    info!(server = %self.registry_key(), "No prompts found on the server");
                }
                Some(prompts)
            }
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "prompt catalog could not be decoded");
                None
            }
        }
    }

    async fn list_resources(&self, session: &dyn RpcSession) -> Option<Vec<ResourceInfo>> {
        let result = match session.request("resources/list", json!({})).await {
            Ok(result) => result,
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "resources listing failed");
                return None;
            }
        };
        let Some(raw) = result.get("resources").cloned() else {
            return Some(Vec::new());
        };
        match serde_json::from_value::<Vec<ResourceInfo>>(raw) {
            Ok(resources) => {
                if resources.is_empty() {
                    info!(server = %self.registry_key(), "No resources found on the server");
                }
                Some(resources)
            }
            Err(err) => {
                warn!(server = %self.registry_key(), %err, "resource catalog could not be decoded");
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{StubSession, add_tool_catalog, connection};
    use super::*;

    #[tokio::test]
    async fn connect_discovers_all_three_catalogs() {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond(
                "prompts/list",
                json!({"prompts": [{"name": "review", "description": "Review code"}]}),
            )
            .respond(
                "resources/list",
                json!({"resources": [{"uri": "search://web", "name": "Web Search"}]}),
            );

        let mut connection = connection("calc", "1.0.0");
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("connect succeeds");

        assert_eq!(connection.tools().map(<[_]>::len), Some(1));
        assert_eq!(connection.prompts().map(<[_]>::len), Some(1));
        assert_eq!(connection.resources().map(<[_]>::len), Some(1));
    }

    #[tokio::test]
    async fn failed_prompt_listing_degrades_only_that_catalog() {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .fail("prompts/list")
            .respond(
                "resources/list",
                json!({"resources": [{"uri": "search://web", "name": "Web Search"}]}),
            );

        let mut connection = connection("calc", "1.0.0");
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("connect succeeds despite prompt failure");

        assert!(connection.prompts().is_none());
        assert_eq!(connection.tools().map(<[_]>::len), Some(1));
        assert_eq!(connection.resources().map(<[_]>::len), Some(1));
    }

    #[tokio::test]
    async fn undecodable_catalog_payload_degrades_to_absent() {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond("prompts/list", json!({"prompts": "garbage"}))
            .respond("resources/list", json!({"resources": 7}));

        let mut connection = connection("calc", "1.0.0");
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("connect succeeds on tools alone");

        assert!(connection.prompts().is_none());
        assert!(connection.resources().is_none());
        assert_eq!(connection.tools().map(<[_]>::len), Some(1));
    }

    #[tokio::test]
    async fn connect_fails_when_every_catalog_is_absent_or_empty() {
        let session = StubSession::new()
            .fail("tools/list")
            .respond("prompts/list", json!({"prompts": []}))
            .fail("resources/list");

        let mut connection = connection("empty", "0.1.0");
        let err = connection
            .connect_with(Arc::new(session))
            .await
            .expect_err("empty server rejected");
        assert!(matches!(err, ConnectionError::EmptyServer { .. }));

        // The failed connect must not leave a usable session behind.
        let err = connection
            .call_tool("anything", None)
            .await
            .expect_err("invalid connection stays unusable");
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn handshake_retains_server_instructions() {
        let session = StubSession::new()
            .respond(
                "initialize",
                json!({"instructions": "Always prefer the add tool."}),
            )
            .respond("tools/list", add_tool_catalog());

        let mut connection = connection("calc", "1.0.0");
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("connect succeeds");
        assert_eq!(
            connection.instructions(),
            Some("Always prefer the add tool.")
        );
    }

    #[tokio::test]
    async fn call_tool_requires_a_connected_session() {
        let connection = connection("calc", "1.0.0");
        let err = connection
            .call_tool("add", None)
            .await
            .expect_err("not connected");
        assert!(matches!(err, ConnectionError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn call_tool_decodes_content_parts() {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond(
                "tools/call",
                json!({"content": [{"type": "text", "text": "5"}], "isError": false}),
            );

        let mut connection = connection("calc", "1.0.0");
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("connect succeeds");

        let mut arguments = Map::new();
        arguments.insert("a".to_string(), json!(2));
        arguments.insert("b".to_string(), json!(3));
        let result = connection
            .call_tool("add", Some(arguments))
            .await
            .expect("tool call succeeds");
        assert_eq!(ToolServerConnection::extract_text(&result), "5");
    }

    #[test]
    fn extract_text_joins_parts_and_blanks_non_text() {
        let result = CallToolResult {
            content: vec![
                ContentPart::Text {
                    text: "first".to_string(),
                },
                ContentPart::Unknown,
                ContentPart::Text {
                    text: "second".to_string(),
                },
            ],
            is_error: false,
        };
        assert_eq!(
            ToolServerConnection::extract_text(&result),
            "first\n\nsecond"
        );
    }

    #[test]
    fn renders_the_exact_tool_result_shape() {
        let result = CallToolResult::text("5");
        assert_eq!(
            ToolServerConnection::extract_text_for_llm("add", &result),
            "{\"type\": \"tool_result\",\"tool_name\": \"add\",\"result\": \"5\"}"
        );
    }
}
