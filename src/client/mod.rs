//! MCP client: lifecycle, handshake and the capability calls built on it

pub mod capabilities;
pub mod lifecycle;
pub mod types;

pub use lifecycle::McpClient;
pub use types::{InitializeResult, ResourceDescriptor, ServerInfo, ToolDescriptor};

use std::fmt;

/// Where a client is in its lifecycle
///
/// States only move forward; any state may drop straight to `Stopped` when
/// the transport fails. A stopped client is never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    NotStarted,
    Starting,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Starting => "Starting",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Initializing)
                | (Initializing, Ready)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Stopped)
        ) || (next == Stopped && self != Stopped)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
