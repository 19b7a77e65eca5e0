//! I/O layer - child process lifecycle and stdio streams
//!
//! This module knows nothing about message formats. It spawns the server,
//! exposes its stdin/stdout as byte streams and keeps stderr drained.

pub mod process;

pub use process::{ChildProcess, ProcessError, ProcessExit, ProcessStdio, ProcessTransport};
