//! Configuration for server processes and client behaviour
//!
//! `ServerConfig` describes how to launch one tool server; `ClientOptions`
//! holds the timing and identity knobs of the client engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for a single request (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default timeout for the `initialize` handshake (10 seconds)
pub const DEFAULT_INITIALIZE_TIMEOUT_SECS: u64 = 10;

/// Grace period for the server to exit on its own after `shutdown`
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 500;

/// Protocol revision announced in `initialize`
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name announced in `initialize`
pub const DEFAULT_CLIENT_NAME: &str = "mcp-test-client";

/// Handler invoked for every non-empty stderr line of the server
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Server Configuration
// ============================================================================

/// How to launch a tool server
///
/// Built once by the caller and handed to the client; the client never
/// mutates it.
#[derive(Clone)]
pub struct ServerConfig {
    /// Display name used in logs and errors
    pub name: String,

    /// Free-form description
    pub description: String,

    /// Executable to spawn
    pub command: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory of the child (inherits ours when unset)
    pub cwd: Option<PathBuf>,

    /// Environment overrides applied on top of the inherited environment
    pub env: BTreeMap<String, String>,

    /// Optional stderr consumer; lines are logged at debug level otherwise
    pub stderr_handler: Option<StderrHandler>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl ServerConfig {
    /// Create a config for `command` with no arguments
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stderr_handler: None,
        }
    }

    /// Build a config from a full command line (`argv[0]` is the executable)
    pub fn from_command_line(
        name: impl Into<String>,
        argv: impl IntoIterator<Item = impl Into<String>>,
    ) -> Option<Self> {
        let mut argv = argv.into_iter().map(Into::into);
        let command = argv.next()?;
        Some(Self::new(name, command).args(argv))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment override
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Forward stderr lines to `handler` instead of the log
    pub fn on_stderr_line<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Human readable command line, for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// Client Options
// ============================================================================

/// Timing and identity settings of the client engine
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Timeout applied by the capability API to each request
    pub request_timeout: Duration,

    /// Timeout for the `initialize` request
    pub initialize_timeout: Duration,

    /// How long to wait for a voluntary exit after `shutdown`
    pub shutdown_grace: Duration,

    /// How long to wait after SIGTERM before SIGKILL
    pub terminate_grace: Duration,

    /// Protocol revision sent in `initialize`
    pub protocol_version: String,

    /// Client name sent in `initialize`
    pub client_name: String,

    /// Client version sent in `initialize`
    pub client_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            initialize_timeout: Duration::from_secs(DEFAULT_INITIALIZE_TIMEOUT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            terminate_grace: Duration::from_millis(DEFAULT_TERMINATE_GRACE_MS),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientOptions {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = timeout;
        self
    }

    /// Set both shutdown grace periods
    pub fn grace_periods(mut self, shutdown: Duration, terminate: Duration) -> Self {
        self.shutdown_grace = shutdown;
        self.terminate_grace = terminate;
        self
    }

    pub fn client_identity(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }
}
