//! Front ends of the `mcp-client` binary
//!
//! Three modes share one started client: a scripted smoke test, a single
//! tool call, and an interactive prompt. Output goes to any `io::Write` so
//! the modes can be exercised without a terminal.

use serde_json::{Value, json};
use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::client::McpClient;
use crate::error::ClientError;

/// Tool the smoke test calls when the server offers it
pub const ECHO_TOOL: &str = "echo";

const HELP: &str = "\
Commands:
  list                 list available tools
  call <tool> [json]   call a tool with JSON arguments (default {})
  resources            list available resources
  read <uri>           read a resource
  ping                 check that the server is alive
  help                 show this help
  quit | exit          stop the server and leave";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("smoke test failed: {0}")]
    SmokeTest(String),
}

/// A line of interactive input that could not be understood
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}' (type 'help' for a list)")]
    Unknown(String),

    #[error("usage: {0}")]
    MissingArgument(&'static str),

    #[error("invalid JSON arguments: {0}")]
    InvalidArguments(String),
}

// ============================================================================
// Interactive Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    List,
    Call { tool: String, arguments: Value },
    Resources,
    Read { uri: String },
    Ping,
    Help,
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> Result<ReplCommand, CommandError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "" => Ok(ReplCommand::Empty),
        "list" => Ok(ReplCommand::List),
        "resources" => Ok(ReplCommand::Resources),
        "ping" => Ok(ReplCommand::Ping),
        "help" | "?" => Ok(ReplCommand::Help),
        "quit" | "exit" => Ok(ReplCommand::Quit),
        "read" if rest.is_empty() => Err(CommandError::MissingArgument("read <uri>")),
        "read" => Ok(ReplCommand::Read {
            uri: rest.to_string(),
        }),
        "call" => {
            let (tool, arguments) = match rest.split_once(char::is_whitespace) {
                Some((tool, arguments)) => (tool, arguments.trim()),
                None => (rest, ""),
            };
            if tool.is_empty() {
                return Err(CommandError::MissingArgument("call <tool> [json]"));
            }
            let arguments = if arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(arguments)
                    .map_err(|e| CommandError::InvalidArguments(e.to_string()))?
            };
            Ok(ReplCommand::Call {
                tool: tool.to_string(),
                arguments,
            })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Parse a `KEY=VALUE` pair given on the command line
pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{input}'")),
    }
}

// ============================================================================
// Modes
// ============================================================================

/// Read commands from `input` until `quit` or end of input
pub async fn run_interactive<R, W>(
    client: &McpClient,
    input: R,
    output: &mut W,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(output, "Connected to '{}'. Type 'help' for commands.", client.config().name)?;
    let mut lines = input.lines();

    loop {
        write!(output, "mcp> ")?;
        output.flush()?;

        let Some(line) = lines.next_line().await? else {
            writeln!(output)?;
            break;
        };

        let command = match parse_command(&line) {
            Ok(ReplCommand::Quit) => break,
            Ok(ReplCommand::Empty) => continue,
            Ok(command) => command,
            Err(e) => {
                writeln!(output, "{e}")?;
                continue;
            }
        };

        debug!("Interactive command: {:?}", command);
        match execute(client, command, output).await {
            Ok(()) => {}
            Err(CliError::Client(e)) if e.is_fatal() => {
                writeln!(output, "Error: {e}")?;
                break;
            }
            Err(CliError::Client(e)) => writeln!(output, "Error: {e}")?,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

async fn execute<W: Write>(
    client: &McpClient,
    command: ReplCommand,
    output: &mut W,
) -> Result<(), CliError> {
    match command {
        ReplCommand::List => {
            let tools = client.list_tools().await?;
            if tools.is_empty() {
                writeln!(output, "No tools available")?;
            }
            for tool in tools {
                match tool.description {
                    Some(description) => writeln!(output, "  {}: {}", tool.name, description)?,
                    None => writeln!(output, "  {}", tool.name)?,
                }
            }
        }
        ReplCommand::Call { tool, arguments } => {
            let result = client.call_tool(&tool, arguments).await?;
            writeln!(output, "{}", serde_json::to_string_pretty(&result)?)?;
        }
        ReplCommand::Resources => {
            let resources = client.list_resources().await?;
            if resources.is_empty() {
                writeln!(output, "No resources available")?;
            }
            for resource in resources {
                match resource.name {
                    Some(name) => writeln!(output, "  {} ({})", resource.uri, name)?,
                    None => writeln!(output, "  {}", resource.uri)?,
                }
            }
        }
        ReplCommand::Read { uri } => {
            let contents = client.read_resource(&uri).await?;
            writeln!(output, "{}", serde_json::to_string_pretty(&contents)?)?;
        }
        ReplCommand::Ping => {
            let alive = client.ping().await;
            writeln!(output, "{}", if alive { "pong" } else { "no pong" })?;
        }
        ReplCommand::Help => writeln!(output, "{HELP}")?,
        ReplCommand::Quit | ReplCommand::Empty => {}
    }
    Ok(())
}

/// Ping, list tools, and call `echo` if the server has one
pub async fn run_smoke_test<W: Write>(client: &McpClient, output: &mut W) -> Result<(), CliError> {
    writeln!(output, "Testing ping...")?;
    if !client.ping().await {
        return Err(CliError::SmokeTest("ping did not return pong".to_string()));
    }
    writeln!(output, "  ping ok")?;

    writeln!(output, "Listing tools...")?;
    let tools = client.list_tools().await?;
    writeln!(output, "  found {} tool(s)", tools.len())?;
    for tool in &tools {
        writeln!(output, "    - {}", tool.name)?;
    }

    if tools.iter().any(|tool| tool.name == ECHO_TOOL) {
        writeln!(output, "Calling {ECHO_TOOL}...")?;
        let result = client
            .call_tool(ECHO_TOOL, json!({"message": "Hello MCP!"}))
            .await?;
        writeln!(output, "{}", serde_json::to_string_pretty(&result)?)?;
    }

    info!("Smoke test against '{}' passed", client.config().name);
    writeln!(output, "All tests passed")?;
    Ok(())
}

/// Call one tool and print its result
pub async fn run_tool<W: Write>(
    client: &McpClient,
    tool: &str,
    arguments: Value,
    output: &mut W,
) -> Result<(), CliError> {
    let result = client.call_tool(tool, arguments).await?;
    writeln!(output, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}
