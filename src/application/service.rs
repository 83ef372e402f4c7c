use crate::application::adapter::AdapterError;
use crate::application::connection::{ConnectionError, ToolServerConnection};
use crate::domain::prompt::PromptBuilder;
use crate::domain::tool::{PromptInfo, ResourceInfo, ToolDefinition};
use crate::infrastructure::model::{ModelClient, ModelError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_ITERATION_CEILING: u32 = 24;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("tool '{tool}' was called with arguments that are not a JSON object: {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Registry of connected tool servers plus the loop that lets the model
/// drive them. Connections are keyed by `"<name>/v<version>"`; registering
/// a duplicate key replaces the earlier connection in place, and tool
/// resolution scans the registry with the last match winning.
pub struct ToolsService {
    connections: Vec<(String, ToolServerConnection)>,
    model: Arc<dyn ModelClient>,
    max_attempts: u32,
    iteration_ceiling: u32,
}

impl ToolsService {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self::with_limits(model, DEFAULT_MAX_ATTEMPTS, DEFAULT_ITERATION_CEILING)
    }

    pub fn with_limits(
        model: Arc<dyn ModelClient>,
        max_attempts: u32,
        iteration_ceiling: u32,
    ) -> Self {
        Self {
            connections: Vec::new(),
            model,
            max_attempts,
            iteration_ceiling,
        }
    }

    pub fn register(&mut self, connection: ToolServerConnection) {
        let key = connection.registry_key();
        if let Some(entry) = self.connections.iter_mut().find(|(existing, _)| *existing == key) {
            info!(key = %key, "replacing registered tool server connection");
            entry.1 = connection;
        } else {
            info!(key = %key, "registering tool server connection");
            self.connections.push((key, connection));
        }
    }

    pub fn connections(&self) -> impl Iterator<Item = (&str, &ToolServerConnection)> {
        self.connections
            .iter()
            .map(|(key, connection)| (key.as_str(), connection))
    }

    /// The connection serving `tool`. With overlapping catalogs the most
    /// recently registered connection wins.
    pub fn find_connection(&self, tool: &str) -> Option<&ToolServerConnection> {
        self.connections
            .iter()
            .rev()
            .map(|(_, connection)| connection)
            .find(|connection| serves_tool(connection, tool))
    }

    /// Adds every registered connection's tool catalog to the prompt, in
    /// registration order.
    pub fn register_tools(&self, prompt: &mut PromptBuilder) -> Result<(), ServiceError> {
        for (key, connection) in &self.connections {
            if let Some(definitions) = connection.tool_definitions()? {
                for definition in definitions {
                    debug!(server = %key, tool = %definition.name, "advertising tool");
                    prompt.add_tool(definition);
                }
            }
        }
        Ok(())
    }

    /// Every connection's prompt catalog, concatenated in registration
    /// order.
    pub fn available_prompts(&self) -> Vec<PromptInfo> {
        self.connections
            .iter()
            .filter_map(|(_, connection)| connection.prompts())
            .flatten()
            .cloned()
            .collect()
    }

    /// Every connection's resource catalog, concatenated in registration
    /// order.
    pub fn available_resources(&self) -> Vec<ResourceInfo> {
        self.connections
            .iter()
            .filter_map(|(_, connection)| connection.resources())
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn disconnect_all(&mut self) -> Result<(), ServiceError> {
        for (key, connection) in &mut self.connections {
            debug!(key = %key, "disconnecting tool server");
            connection.disconnect().await?;
        }
        Ok(())
    }

    /// Advertises every registered tool on the prompt, then queries the
    /// model until it produces a tool call this service can execute, and
    /// appends the call and its rendered result to the prompt.
    ///
    /// Returns `Ok(true)` when a validated call was executed. Returns
    /// `Ok(false)` when the model never proposed a call within the retry
    /// budget, when the proposed tool is not served by any registered
    /// connection, or when the iteration ceiling was hit. A turn whose
    /// argument keys do not match the tool's declared required list resets
    /// the retry budget instead of consuming it; the ceiling bounds the
    /// loop regardless.
    pub async fn execute_tool_call(
        &self,
        prompt: &mut PromptBuilder,
    ) -> Result<bool, ServiceError> {
        self.register_tools(prompt)?;
        let mut attempts = 0;
        let mut iterations = 0;
        while attempts < self.max_attempts {
            iterations += 1;
            if iterations > self.iteration_ceiling {
                warn!(
                    ceiling = self.iteration_ceiling,
                    "tool call loop hit the iteration ceiling"
                );
                return Ok(false);
            }

            let turn = match self.model.query(prompt, true).await {
                Ok(turn) => turn,
                Err(err) => {
                    error!(%err, "model query failed");
                    return Err(err.into());
                }
            };
            let Some(call) = turn.tool_calls.into_iter().next() else {
                attempts += 1;
                debug!(attempts, "model proposed no tool call");
                continue;
            };

            let Some(connection) = self.find_connection(&call.name) else {
                warn!(tool = %call.name, "no registered connection serves the requested tool");
                return Ok(false);
            };

            let arguments: Map<String, Value> =
                serde_json::from_str(&call.arguments).map_err(|source| {
                    ServiceError::InvalidArguments {
                        tool: call.name.clone(),
                        source,
                    }
                })?;

            let definitions = connection.tool_definitions()?.unwrap_or_default();
            let Some(definition) = definitions.iter().find(|def| def.name == call.name) else {
                return Ok(false);
            };
            if !arguments_match(definition, &arguments) {
                warn!(
                    tool = %call.name,
                    required = ?definition.input_schema.required,
                    provided = ?arguments.keys().collect::<Vec<_>>(),
                    "argument keys do not match the declared required list"
                );
                attempts = 0;
                continue;
            }

            info!(tool = %call.name, server = %connection.registry_key(), "executing tool call");
            prompt.append_tool_message(
                call.id.clone(),
                format!(
                    "[ Calling tool {} with args {} ]",
                    call.name,
                    Value::Object(arguments.clone())
                ),
            );
            let result = match connection.call_tool(&call.name, Some(arguments)).await {
                Ok(result) => result,
                Err(err) => {
                    error!(tool = %call.name, %err, "tool invocation failed");
                    return Err(err.into());
                }
            };
            let rendered = ToolServerConnection::extract_text_for_llm(&call.name, &result);
            prompt.append_tool_message(call.id, rendered);
            return Ok(true);
        }
        warn!(
            max_attempts = self.max_attempts,
            "retry budget exhausted without a tool call"
        );
        Ok(false)
    }
}

fn serves_tool(connection: &ToolServerConnection, tool: &str) -> bool {
    connection
        .tools()
        .is_some_and(|tools| tools.iter().any(|entry| entry.name == tool))
}

/// Key-set equality: the call must supply exactly the declared required
/// names, nothing more and nothing less.
fn arguments_match(definition: &ToolDefinition, arguments: &Map<String, Value>) -> bool {
    let provided: BTreeSet<&str> = arguments.keys().map(String::as_str).collect();
    let required: BTreeSet<&str> = definition
        .input_schema
        .required
        .iter()
        .map(String::as_str)
        .collect();
    provided == required
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::connection::test_support::{StubSession, add_tool_catalog};
    use crate::application::connection::ToolServerConnection;
    use crate::domain::types::{ChatMessage, MessageRole};
    use crate::infrastructure::model::{ModelTurn, ToolCallRequest};
    use crate::infrastructure::transport::Transport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model: pops turns from the script, then keeps repeating the
    /// fallback turn. Counts queries.
    struct StubModel {
        script: Mutex<VecDeque<ModelTurn>>,
        fallback: ModelTurn,
        queries: AtomicUsize,
    }

    impl StubModel {
        fn new(script: Vec<ModelTurn>, fallback: ModelTurn) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                queries: AtomicUsize::new(0),
            }
        }

        fn repeating(fallback: ModelTurn) -> Self {
            Self::new(Vec::new(), fallback)
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn query(
            &self,
            _prompt: &PromptBuilder,
            _with_tools: bool,
        ) -> Result<ModelTurn, ModelError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            Ok(script.pop_front().unwrap_or_else(|| self.fallback.clone()))
        }
    }

    fn plain_turn(content: &str) -> ModelTurn {
        ModelTurn {
            message: ChatMessage::new(MessageRole::Assistant, content),
            tool_calls: Vec::new(),
        }
    }

    fn calling_turn(name: &str, arguments: &str) -> ModelTurn {
        ModelTurn {
            message: ChatMessage::new(MessageRole::Assistant, ""),
            tool_calls: vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    async fn add_server(name: &str, answer: &str) -> ToolServerConnection {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond(
                "tools/call",
                json!({"content": [{"type": "text", "text": answer}]}),
            );
        let mut connection = ToolServerConnection::with_identity(
            Transport::stdio("stub-server.py"),
            name,
            "1.0.0",
        );
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("stub server connects");
        connection
    }

    #[tokio::test]
    async fn last_registered_connection_wins_the_tie_break() {
        let model = Arc::new(StubModel::repeating(calling_turn(
            "add",
            "{\"a\":2,\"b\":3}",
        )));
        let mut service = ToolsService::new(model);
        service.register(add_server("first", "from-first").await);
        service.register(add_server("second", "from-second").await);

        let mut prompt = PromptBuilder::new();
        let executed = service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop succeeds");
        assert!(executed);
        let last = prompt.messages().last().expect("tool message appended");
        assert!(last.content.contains("from-second"), "got {}", last.content);

        // Reversed registration order flips the winner.
        let model = Arc::new(StubModel::repeating(calling_turn(
            "add",
            "{\"a\":2,\"b\":3}",
        )));
        let mut service = ToolsService::new(model);
        service.register(add_server("second", "from-second").await);
        service.register(add_server("first", "from-first").await);

        let mut prompt = PromptBuilder::new();
        service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop succeeds");
        let last = prompt.messages().last().expect("tool message appended");
        assert!(last.content.contains("from-first"), "got {}", last.content);
    }

    #[tokio::test]
    async fn duplicate_key_replaces_the_entry_in_place() {
        let model = Arc::new(StubModel::repeating(plain_turn("idle")));
        let mut service = ToolsService::new(model);
        service.register(add_server("calc", "one").await);
        service.register(add_server("other", "two").await);
        service.register(add_server("calc", "three").await);

        let keys: Vec<&str> = service.connections().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["calc/v1.0.0", "other/v1.0.0"]);
    }

    #[tokio::test]
    async fn retry_exhaustion_returns_false_and_leaves_the_prompt_alone() {
        let model = Arc::new(StubModel::repeating(plain_turn("no tools needed")));
        let mut service = ToolsService::with_limits(model.clone(), 3, 24);
        service.register(add_server("calc", "5").await);

        let mut prompt = PromptBuilder::new();
        prompt.append_user_message("add 2 and 3");
        let executed = service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop finishes");

        assert!(!executed);
        assert_eq!(model.queries(), 3);
        assert_eq!(prompt.messages().len(), 1);
    }

    #[tokio::test]
    async fn argument_mismatch_resets_the_budget_until_the_ceiling() {
        // Server requires {a, b, c}; the model insists on {a, b}.
        let catalog = json!({
            "tools": [{
                "name": "add",
                "description": "Adds three numbers.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": {"type": "number"},
                        "b": {"type": "number"},
                        "c": {"type": "number"}
                    },
                    "required": ["a", "b", "c"]
                }
            }]
        });
        let session = StubSession::new().respond("tools/list", catalog);
        let mut connection = ToolServerConnection::with_identity(
            Transport::stdio("stub-server.py"),
            "calc",
            "1.0.0",
        );
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("stub server connects");

        let model = Arc::new(StubModel::repeating(calling_turn(
            "add",
            "{\"a\":2,\"b\":3}",
        )));
        let mut service = ToolsService::with_limits(model.clone(), 3, 5);
        service.register(connection);

        let mut prompt = PromptBuilder::new();
        let executed = service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop finishes");

        assert!(!executed);
        // The reset keeps the loop alive past the retry budget; only the
        // ceiling stops it.
        assert_eq!(model.queries(), 5);
    }

    #[tokio::test]
    async fn unknown_tool_returns_false() {
        let model = Arc::new(StubModel::repeating(calling_turn("subtract", "{}")));
        let mut service = ToolsService::new(model.clone());
        service.register(add_server("calc", "5").await);

        let mut prompt = PromptBuilder::new();
        let executed = service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop finishes");
        assert!(!executed);
        assert_eq!(model.queries(), 1);
    }

    #[tokio::test]
    async fn executed_call_appends_the_exact_result_shape() {
        let model = Arc::new(StubModel::new(
            vec![
                plain_turn("thinking"),
                calling_turn("add", "{\"a\":2,\"b\":3}"),
            ],
            plain_turn("done"),
        ));
        let mut service = ToolsService::new(model);
        service.register(add_server("calc", "5").await);

        let mut prompt = PromptBuilder::new();
        prompt.append_user_message("add 2 and 3");
        let executed = service
            .execute_tool_call(&mut prompt)
            .await
            .expect("loop succeeds");

        assert!(executed);
        // The request echo and the result, both tied to the call id.
        let messages = prompt.messages();
        assert_eq!(messages.len(), 3);
        let request = &messages[1];
        assert_eq!(request.role, MessageRole::Tool);
        assert_eq!(request.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(
            request.content,
            "[ Calling tool add with args {\"a\":2,\"b\":3} ]"
        );
        let result = &messages[2];
        assert_eq!(result.role, MessageRole::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(
            result.content,
            "{\"type\": \"tool_result\",\"tool_name\": \"add\",\"result\": \"5\"}"
        );
    }

    struct FailingModel;

    #[async_trait]
    impl ModelClient for FailingModel {
        async fn query(
            &self,
            _prompt: &PromptBuilder,
            _with_tools: bool,
        ) -> Result<ModelTurn, ModelError> {
            Err(ModelError::InvalidResponse {
                reason: "scripted outage".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let mut service = ToolsService::new(Arc::new(FailingModel));
        service.register(add_server("calc", "5").await);

        let mut prompt = PromptBuilder::new();
        let err = service
            .execute_tool_call(&mut prompt)
            .await
            .expect_err("model failure surfaces");
        assert!(matches!(err, ServiceError::Model(_)));
    }

    #[tokio::test]
    async fn tool_invocation_failure_propagates() {
        let session = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .fail("tools/call");
        let mut connection = ToolServerConnection::with_identity(
            Transport::stdio("stub-server.py"),
            "calc",
            "1.0.0",
        );
        connection
            .connect_with(Arc::new(session))
            .await
            .expect("stub server connects");

        let model = Arc::new(StubModel::repeating(calling_turn(
            "add",
            "{\"a\":2,\"b\":3}",
        )));
        let mut service = ToolsService::new(model);
        service.register(connection);

        let mut prompt = PromptBuilder::new();
        let err = service
            .execute_tool_call(&mut prompt)
            .await
            .expect_err("transport failure surfaces");
        assert!(matches!(err, ServiceError::Connection(_)));
    }

    #[tokio::test]
    async fn malformed_argument_json_is_an_error() {
        let model = Arc::new(StubModel::repeating(calling_turn("add", "not json")));
        let mut service = ToolsService::new(model);
        service.register(add_server("calc", "5").await);

        let mut prompt = PromptBuilder::new();
        let err = service
            .execute_tool_call(&mut prompt)
            .await
            .expect_err("malformed arguments propagate");
        assert!(matches!(err, ServiceError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn aggregates_catalogs_in_registration_order() {
        let first = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond(
                "prompts/list",
                json!({"prompts": [{"name": "alpha"}]}),
            );
        let second = StubSession::new()
            .respond("tools/list", add_tool_catalog())
            .respond(
                "prompts/list",
                json!({"prompts": [{"name": "beta"}]}),
            )
            .respond(
                "resources/list",
                json!({"resources": [{"uri": "search://web", "name": "Web Search"}]}),
            );

        let mut a = ToolServerConnection::with_identity(
            Transport::stdio("stub-server.py"),
            "a",
            "1.0.0",
        );
        a.connect_with(Arc::new(first)).await.expect("connects");
        let mut b = ToolServerConnection::with_identity(
            Transport::stdio("stub-server.py"),
            "b",
            "1.0.0",
        );
        b.connect_with(Arc::new(second)).await.expect("connects");

        let model = Arc::new(StubModel::repeating(plain_turn("idle")));
        let mut service = ToolsService::new(model);
        service.register(a);
        service.register(b);

        let names: Vec<String> = service
            .available_prompts()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(service.available_resources().len(), 1);
    }
}
