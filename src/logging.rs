//! Logging setup
//!
//! Diagnostics always go to stderr or a file, never to stdout: the CLI's
//! stdout belongs to tool output and interactive prompts.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when neither `RUST_LOG` nor `--log-level` is given
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "mcp_stdio_client::rpc=trace")
    pub level: String,
    /// Log file path; stderr when `None`
    pub file_path: Option<PathBuf>,
    /// Emit one JSON object per event
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Build from `RUST_LOG`, `MCP_LOG_FILE`, `MCP_LOG_UNIQUE` and `MCP_LOG_JSON`
    pub fn from_env() -> Self {
        let unique = env_flag("MCP_LOG_UNIQUE");
        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            file_path: env::var("MCP_LOG_FILE").ok().map(|path| {
                let path = PathBuf::from(path);
                if unique {
                    with_pid_suffix(&path, std::process::id())
                } else {
                    path
                }
            }),
            json_format: env_flag("MCP_LOG_JSON"),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| value == "true" || value == "1")
}

/// `client.log` -> `client.<pid>.log`, so concurrent clients don't share a file
fn with_pid_suffix(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let file_name = match path.extension() {
        Some(extension) => format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            pid,
            extension.to_string_lossy()
        ),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Install the global subscriber described by `config`
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            subscriber
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new().create(true).append(true).open(file_path)?;
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .try_init()?;
        }
        (None, false) => {
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
    }

    Ok(())
}

/// Log one JSON-RPC message crossing the wire in a single structured event
#[macro_export]
macro_rules! log_rpc_message {
    ($level:expr, $direction:expr, $label:expr, $message:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            label = %$label,
            payload = ?$message,
            "JSON-RPC message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = %$operation,
            duration_ms = $duration.as_millis() as u64,
            "Performance timing"
        );
    };
}
