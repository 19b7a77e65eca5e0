//! Stdio client for JSON-RPC 2.0 tool servers (Model Context Protocol)
//!
//! The crate is layered bottom-up:
//!
//! - **io**: child process lifecycle and stderr draining
//! - **rpc**: framing, message routing, request/response correlation
//! - **client**: handshake/shutdown state machine and the typed capability API
//!
//! ```no_run
//! use mcp_stdio_client::{ClientOptions, McpClient, ServerConfig};
//!
//! # async fn demo() -> Result<(), mcp_stdio_client::ClientError> {
//! let config = ServerConfig::new("tools", "python3").arg("mcp_server.py");
//! let client = McpClient::new(config, ClientOptions::default());
//! client.start().await?;
//!
//! for tool in client.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//!
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod rpc;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod test_utils;

pub use client::{
    ClientState, InitializeResult, McpClient, ResourceDescriptor, ServerInfo, ToolDescriptor,
};
pub use config::{ClientOptions, ServerConfig};
pub use error::ClientError;
pub use rpc::Message;
