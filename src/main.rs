use clap::Parser;
use mcp_stdio_client::cli::{self, CliError, parse_key_value};
use mcp_stdio_client::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use mcp_stdio_client::logging::{LogConfig, init_logging};
use mcp_stdio_client::{ClientOptions, McpClient, ServerConfig};

use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{BufReader, stdin};
use tracing::{info, warn};

/// Stdio test client for MCP tool servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server executable (overrides MCP_SERVER_COMMAND env var)
    #[arg(env = "MCP_SERVER_COMMAND", value_name = "COMMAND")]
    command: String,

    /// Arguments passed to the server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    args: Vec<String>,

    /// Display name of the server in logs
    #[arg(long, default_value = "server")]
    name: String,

    /// Working directory of the server
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the server (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    timeout: u64,

    /// Run the smoke test (ping, list tools, call echo) and exit
    #[arg(long, conflicts_with = "tool")]
    test: bool,

    /// Call a single tool and print its result
    #[arg(long, value_name = "NAME")]
    tool: Option<String>,

    /// JSON arguments for --tool
    #[arg(long, value_name = "JSON", default_value = "{}", requires = "tool")]
    tool_args: String,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides MCP_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(&self.name, &self.command).args(&self.args);
        if let Some(cwd) = &self.cwd {
            config = config.cwd(cwd);
        }
        for (key, value) in &self.env {
            config = config.env(key, value);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // Validate tool arguments before starting anything
    let tool_arguments: Value = match serde_json::from_str(&args.tool_args) {
        Ok(arguments) => arguments,
        Err(e) => {
            eprintln!("Invalid --tool-args JSON: {e}");
            std::process::exit(1);
        }
    };

    let options = ClientOptions::default().request_timeout(Duration::from_secs(args.timeout));
    let client = McpClient::new(args.server_config(), options);

    if let Err(e) = client.start().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    info!("Connected to '{}'", args.name);

    let mut stdout = std::io::stdout();
    let outcome: Result<(), CliError> = if args.test {
        cli::run_smoke_test(&client, &mut stdout).await
    } else if let Some(tool) = &args.tool {
        cli::run_tool(&client, tool, tool_arguments, &mut stdout).await
    } else {
        cli::run_interactive(&client, BufReader::new(stdin()), &mut stdout).await
    };

    if let Err(e) = client.stop().await {
        warn!("Failed to stop server cleanly: {}", e);
    }

    if let Err(e) = outcome {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
