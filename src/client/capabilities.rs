//! MCP capability calls
//!
//! Each call is a single request with the client's request timeout and is
//! only allowed once the client is `Ready`.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::client::lifecycle::McpClient;
use crate::client::types::{ResourceDescriptor, ToolDescriptor};
use crate::error::ClientError;

impl McpClient {
    /// `tools/list`, in the order the server returned them
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let result = self.send_request("tools/list", None).await?;
        let tools: Vec<ToolDescriptor> = list_field(&result, "tools/list", "tools")?;
        debug!("Server '{}' offers {} tool(s)", self.config().name, tools.len());
        Ok(tools)
    }

    /// `tools/call`; returns the server's result untouched
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ClientError> {
        let params = json!({ "name": name, "arguments": arguments });
        debug!("Calling tool '{}' on server '{}'", name, self.config().name);
        self.send_request("tools/call", Some(params)).await
    }

    /// `resources/list`
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ClientError> {
        let result = self.send_request("resources/list", None).await?;
        list_field(&result, "resources/list", "resources")
    }

    /// `resources/read`; returns the server's result untouched
    pub async fn read_resource(&self, uri: &str) -> Result<Value, ClientError> {
        self.send_request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    /// Liveness probe: true only if the server answers `{"pong": true}`
    ///
    /// Never fails; every error or odd answer is reported as `false`.
    pub async fn ping(&self) -> bool {
        match self.send_request("ping", Some(json!({}))).await {
            Ok(result) => result.get("pong").and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                debug!("Ping to server '{}' failed: {}", self.config().name, e);
                false
            }
        }
    }
}

/// Decode `result[field]` as a list; missing or null means empty
fn list_field<T: DeserializeOwned>(
    result: &Value,
    method: &str,
    field: &str,
) -> Result<Vec<T>, ClientError> {
    match result.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => {
            serde_json::from_value(items.clone()).map_err(|e| ClientError::UnexpectedResponse {
                method: method.to_string(),
                reason: format!("'{field}': {e}"),
            })
        }
    }
}
