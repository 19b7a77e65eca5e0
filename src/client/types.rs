//! Typed shapes of MCP results
//!
//! Only the fields the client relies on are typed; everything else a server
//! sends is kept as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a `tools/list` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema of the tool's arguments
    #[serde(default = "empty_object")]
    pub input_schema: Value,
}

/// One entry of a `resources/list` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Server identity from the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,

    #[serde(default)]
    pub version: String,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server settled on
    #[serde(default)]
    pub protocol_version: Option<String>,

    /// Declared server capabilities, kept verbatim
    #[serde(default = "empty_object")]
    pub capabilities: Value,

    #[serde(default)]
    pub server_info: Option<ServerInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Whether the server declared capability `name` (e.g. "tools")
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).is_some_and(|value| !value.is_null())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_descriptor_from_wire() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "echo",
            "description": "Echo a message back",
            "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}
        }))
        .unwrap();

        assert_eq!(tool.name, "echo");
        assert_eq!(tool.description.as_deref(), Some("Echo a message back"));
        assert_eq!(tool.input_schema["properties"]["message"]["type"], "string");
    }

    #[test]
    fn test_tool_descriptor_minimal() {
        let tool: ToolDescriptor = serde_json::from_value(json!({"name": "noop"})).unwrap();
        assert_eq!(tool.description, None);
        assert_eq!(tool.input_schema, json!({}));
    }

    #[test]
    fn test_resource_descriptor_mime_type() {
        let resource: ResourceDescriptor = serde_json::from_value(json!({
            "uri": "trial://protocols/42",
            "name": "Protocol 42",
            "mimeType": "application/json"
        }))
        .unwrap();
        assert_eq!(resource.mime_type.as_deref(), Some("application/json"));
        assert_eq!(resource.description, None);
    }

    #[test]
    fn test_initialize_result() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}, "logging": null},
            "serverInfo": {"name": "trial-tools", "version": "1.2.0"}
        }))
        .unwrap();

        assert_eq!(result.protocol_version.as_deref(), Some("2024-11-05"));
        assert_eq!(result.server_info.as_ref().unwrap().name, "trial-tools");
        assert!(result.has_capability("tools"));
        assert!(!result.has_capability("logging"));
        assert!(!result.has_capability("resources"));
    }

    #[test]
    fn test_initialize_result_tolerates_empty_object() {
        let result: InitializeResult = serde_json::from_value(json!({})).unwrap();
        assert_eq!(result.server_info, None);
        assert_eq!(result.capabilities, json!({}));
    }
}
