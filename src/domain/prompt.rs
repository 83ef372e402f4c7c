use crate::application::adapter::ToolAdapter;
use crate::domain::tool::ToolDefinition;
use crate::domain::types::{ChatMessage, MessageRole};
use serde_json::Value;

/// Ordered message history plus the tool definitions advertised to the
/// model client. Owned by the caller; the tools service only appends.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    messages: Vec<ChatMessage>,
    tool_definitions: Vec<ToolDefinition>,
    adapter: ToolAdapter,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn tool_definitions(&self) -> &[ToolDefinition] {
        &self.tool_definitions
    }

    pub fn add_tool(&mut self, definition: ToolDefinition) -> &mut Self {
        self.tool_definitions.push(definition);
        self
    }

    pub fn append_system_message(&mut self, content: impl Into<String>) -> &mut Self {
        self.messages
            .push(ChatMessage::new(MessageRole::System, content));
        self
    }

    pub fn append_user_message(&mut self, content: impl Into<String>) -> &mut Self {
        self.messages
            .push(ChatMessage::new(MessageRole::User, content));
        self
    }

    pub fn append_assistant_message(&mut self, content: impl Into<String>) -> &mut Self {
        self.messages
            .push(ChatMessage::new(MessageRole::Assistant, content));
        self
    }

    pub fn append_tool_message(
        &mut self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> &mut Self {
        self.messages.push(ChatMessage::tool(tool_call_id, content));
        self
    }

    /// Renders the message list together with the model-facing function
    /// tools translated from the registered definitions.
    pub fn build(&self) -> (Vec<ChatMessage>, Vec<Value>) {
        let messages = self.messages.clone();
        let tools = self
            .tool_definitions
            .iter()
            .map(|definition| self.adapter.definition_to_function_tool(definition))
            .collect();
        (messages, tools)
    }
}
