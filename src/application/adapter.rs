use crate::domain::tool::{InputSchema, ServerTool, ToolDefinition};
use serde_json::{Map, Value, json};
use thiserror::Error;

const MISSING_DESCRIPTION: &str =
    "The tool server did not provide a description for this tool.";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("tool '{tool}' schema does not declare a required-property list")]
    MissingRequiredList { tool: String },
    #[error("tool '{tool}' schema is malformed: {reason}")]
    MalformedSchema { tool: String, reason: String },
}

/// Translates tool descriptions between the server wire dialect and the
/// model-facing function-tool dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolAdapter;

impl ToolAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Lifts `type`, `properties`, and `required` out of the server's raw
    /// schema into the canonical flat shape. A schema without a `required`
    /// key is rejected rather than silently defaulted.
    pub fn server_tool_to_definition(
        &self,
        tool: &ServerTool,
    ) -> Result<ToolDefinition, AdapterError> {
        let schema = tool
            .input_schema
            .as_object()
            .ok_or_else(|| AdapterError::MalformedSchema {
                tool: tool.name.clone(),
                reason: "input schema is not an object".to_string(),
            })?;

        let schema_type = schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("object")
            .to_string();
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required = schema
            .get("required")
            .ok_or_else(|| AdapterError::MissingRequiredList {
                tool: tool.name.clone(),
            })?;
        let required: Vec<String> =
            serde_json::from_value(required.clone()).map_err(|source| {
                AdapterError::MalformedSchema {
                    tool: tool.name.clone(),
                    reason: format!("required list could not be decoded: {source}"),
                }
            })?;

        Ok(ToolDefinition {
            name: tool.name.clone(),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| MISSING_DESCRIPTION.to_string()),
            input_schema: InputSchema {
                schema_type,
                properties,
                required,
            },
        })
    }

    /// Packages a canonical definition as a model-facing function tool.
    /// Property fields are copied verbatim except `enum` value lists, which
    /// are rendered as arrays of stringified entries.
    pub fn definition_to_function_tool(&self, definition: &ToolDefinition) -> Value {
        let mut properties = Map::new();
        for (name, descriptor) in &definition.input_schema.properties {
            let mut rendered = Map::new();
            if let Some(fields) = descriptor.as_object() {
                for (key, value) in fields {
                    if key == "enum" {
                        if let Some(entries) = value.as_array() {
                            rendered.insert(
                                key.clone(),
                                Value::Array(entries.iter().map(stringify).collect()),
                            );
                            continue;
                        }
                    }
                    rendered.insert(key.clone(), value.clone());
                }
            }
            properties.insert(name.clone(), Value::Object(rendered));
        }

        json!({
            "type": "function",
            "function": {
                "name": definition.name,
                "description": definition.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": definition.input_schema.required,
                }
            }
        })
    }
}

fn stringify(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.clone()),
        other => Value::String(other.to_string()),
    }
}
