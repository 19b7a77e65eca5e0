//! JSON-RPC 2.0 message model
//!
//! One `Message` type covers requests, notifications and responses: every
//! member is optional on the wire and the router decides what a decoded
//! message is by looking at `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Error Codes (as per JSON-RPC specification)
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i64 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i64 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

// ============================================================================
// Message
// ============================================================================

/// A decoded or to-be-encoded JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// JSON-RPC version (always "2.0" on encode)
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Correlation id (requests and responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Method name (requests and notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Result (successful responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error object (failed responses), kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Request carrying correlation id `id`
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(Value::from(id)),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Successful response
    pub fn response(id: Value, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Error response
    pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(json!({ "code": code, "message": message.into() })),
            ..Self::empty()
        }
    }

    /// Integer correlation id, if any
    ///
    /// Requests issued by this client always carry non-negative integer ids,
    /// so anything else can never match a pending request.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Has a method and no id
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Has an id and no method
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// Short label for logs: method name or id
    pub fn label(&self) -> String {
        match (&self.method, &self.id) {
            (Some(method), _) => method.clone(),
            (None, Some(id)) => format!("response#{id}"),
            (None, None) => "message".to_string(),
        }
    }
}
