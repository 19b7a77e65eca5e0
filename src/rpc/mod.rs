//! JSON-RPC layer
//!
//! Framing, message model, correlation and routing for one server
//! connection. Nothing here knows about processes or MCP methods.

pub mod codec;
pub mod connection;
pub mod message;
pub mod registry;
pub mod router;
pub mod writer;

pub use codec::{FrameCodec, MAX_MESSAGE_SIZE};
pub use connection::{CloseHandler, RpcConnection};
pub use message::{JSONRPC_VERSION, Message, error_codes};
pub use registry::PendingRegistry;
pub use router::{Route, Router, UnsolicitedQueue};
pub use writer::FrameWriter;
