//! Error types for the client engine
//!
//! `ClientError` is what callers see. Per-request failures (`Timeout`,
//! `Remote`) only ever reach the caller of that request; client-fatal
//! failures (`Startup`, `TransportClosed`) also unblock every pending request.

use serde_json::Value;
use std::time::Duration;

use crate::client::ClientState;

// ============================================================================
// Client Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server could not be spawned or failed the handshake
    #[error("server '{name}' failed to start: {reason}")]
    Startup { name: String, reason: String },

    /// The server exited or its streams closed
    #[error("transport closed: {reason}")]
    TransportClosed { reason: String },

    /// A single request exceeded its deadline
    #[error("request '{method}' timed out after {}ms", elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },

    /// The server answered with a JSON-RPC `error` object
    #[error("server error: {}", describe_remote_error(payload))]
    Remote { payload: Value },

    /// The operation is not allowed in the current lifecycle state
    #[error("invalid client state: current={current}, expected={expected}")]
    InvalidState {
        current: ClientState,
        expected: &'static str,
    },

    /// A request could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The server's result did not have the expected shape
    #[error("unexpected response to '{method}': {reason}")]
    UnexpectedResponse { method: String, reason: String },
}

impl ClientError {
    pub fn transport_closed(reason: impl Into<String>) -> Self {
        Self::TransportClosed {
            reason: reason.into(),
        }
    }

    /// JSON-RPC error code of a `Remote` error
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { payload } => payload.get("code").and_then(Value::as_i64),
            _ => None,
        }
    }

    /// Whether the client instance is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Startup { .. } | Self::TransportClosed { .. })
    }
}

fn describe_remote_error(payload: &Value) -> String {
    let code = payload.get("code").and_then(Value::as_i64);
    let message = payload.get("message").and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => format!("[{code}] {message}"),
        (None, Some(message)) => message.to_string(),
        _ => payload.to_string(),
    }
}

// ============================================================================
// Frame Decoding Errors
// ============================================================================

/// Malformed frame; logged by the decoder and the frame dropped
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("header block is not valid UTF-8")]
    InvalidHeaderEncoding,

    #[error("invalid JSON body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("stream closed with {pending} undecoded bytes")]
    Truncated { pending: usize },
}
