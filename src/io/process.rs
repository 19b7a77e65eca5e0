//! Process management layer
//!
//! Spawns the tool server, hands out its stdin/stdout as byte streams and
//! keeps stderr drained so a chatty server never blocks on a full pipe.
//! Exit is observed by a dedicated wait task and published on a watch
//! channel, which is what the client uses to detect unexpected exits.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
#[cfg(not(unix))]
use tracing::warn;
use tracing::{debug, error, info, trace};

use crate::config::{ServerConfig, StderrHandler};

// ============================================================================
// Process Types
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Stdio streams already taken")]
    StdioTaken,

    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        signal: &'static str,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Byte streams connected to the child's stdin and stdout
pub struct ProcessStdio {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

// ============================================================================
// Process Transport Trait
// ============================================================================

/// A running child process as seen by the client
///
/// All methods take `&self`; implementations synchronise internally so the
/// lifecycle controller and the exit monitor can share one handle.
#[async_trait]
pub trait ProcessTransport: Send + Sync {
    /// Take the stdin/stdout streams (only once)
    fn take_stdio(&self) -> Result<ProcessStdio, ProcessError>;

    fn process_id(&self) -> Option<u32>;

    /// Whether the process has not exited yet
    fn is_alive(&self) -> bool;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&self) -> Result<(), ProcessError>;

    /// Force the process to exit (SIGKILL)
    fn kill(&self) -> Result<(), ProcessError>;

    /// Wait up to `timeout` for the process to exit
    async fn wait(&self, timeout: Duration) -> Option<ProcessExit>;

    /// Channel that flips to `Some` once the process exits
    fn exit_events(&self) -> watch::Receiver<Option<ProcessExit>>;
}

// ============================================================================
// Child Process Implementation
// ============================================================================

/// Tool server spawned via `tokio::process::Command`
///
/// Dropping the handle kills the child.
pub struct ChildProcess {
    /// Display name for logs
    name: String,

    /// OS process id, captured at spawn
    pid: Option<u32>,

    /// Stdio streams until the client takes them
    stdio: Mutex<Option<ProcessStdio>>,

    /// Asks the wait task to kill the child
    kill_sender: Mutex<Option<oneshot::Sender<()>>>,

    /// Exit status published by the wait task
    exit_receiver: watch::Receiver<Option<ProcessExit>>,

    /// Stderr drain task handle
    stderr_task: JoinHandle<()>,
}

impl ChildProcess {
    /// Spawn the server described by `config`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &ServerConfig) -> Result<Self, ProcessError> {
        info!(
            "Starting server '{}': {}",
            config.name,
            config.command_line()
        );

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        info!("Server '{}' started with PID: {:?}", config.name, pid);

        // Extract stdio streams before moving the child into the wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        let stderr_task =
            Self::spawn_stderr_drain(config.name.clone(), stderr, config.stderr_handler.clone());

        let (kill_sender, kill_receiver) = oneshot::channel();
        let (exit_sender, exit_receiver) = watch::channel(None);
        Self::spawn_wait_task(config.name.clone(), child, kill_receiver, exit_sender);

        Ok(Self {
            name: config.name.clone(),
            pid,
            stdio: Mutex::new(Some(ProcessStdio {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
            })),
            kill_sender: Mutex::new(Some(kill_sender)),
            exit_receiver,
            stderr_task,
        })
    }

    /// Always drains stderr; lines go to the handler when one is installed
    fn spawn_stderr_drain(
        name: String,
        stderr: ChildStderr,
        handler: Option<StderrHandler>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();

            trace!(
                "ChildProcess: Starting stderr drain for '{}' (handler: {})",
                name,
                if handler.is_some() {
                    "installed"
                } else {
                    "logging only"
                }
            );

            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => {
                        trace!("ChildProcess: stderr EOF reached for '{}'", name);
                        break;
                    }
                    Ok(_) => {
                        let content = String::from_utf8_lossy(&line).trim().to_string();
                        if content.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(content),
                            None => debug!("[{} stderr] {}", name, content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read stderr of '{}': {}", name, e);
                        break;
                    }
                }
            }
        })
    }

    /// Owns the child until it exits, killing it on request
    fn spawn_wait_task(
        name: String,
        mut child: Child,
        kill_receiver: oneshot::Receiver<()>,
        exit_sender: watch::Sender<Option<ProcessExit>>,
    ) {
        tokio::spawn(async move {
            // A dropped sender also means kill: the handle is gone
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_receiver => {
                    info!("Killing server '{}'", name);
                    if let Err(e) = child.start_kill() {
                        error!("Failed to kill server '{}': {}", name, e);
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => {
                    info!("Server '{}' exited with status: {}", name, status);
                    ProcessExit {
                        code: status.code(),
                    }
                }
                Err(e) => {
                    error!("Error waiting for server '{}': {}", name, e);
                    ProcessExit { code: None }
                }
            };

            exit_sender.send_replace(Some(exit));
        });
    }
}

#[async_trait]
impl ProcessTransport for ChildProcess {
    fn take_stdio(&self) -> Result<ProcessStdio, ProcessError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.stdio
            .lock()
            .unwrap()
            .take()
            .ok_or(ProcessError::StdioTaken)
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit_receiver.borrow().is_none()
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid.filter(|_| self.is_alive()) else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                let source = io::Error::last_os_error();
                if source.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(ProcessError::Signal {
                    signal: "SIGTERM",
                    pid,
                    source,
                });
            }
            info!("Sent SIGTERM to server '{}' (PID {})", self.name, pid);
            Ok(())
        }

        #[cfg(not(unix))]
        {
            warn!(
                "No cooperative termination on this platform, killing server '{}' (PID {})",
                self.name, pid
            );
            self.kill()
        }
    }

    fn kill(&self) -> Result<(), ProcessError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        if let Some(sender) = self.kill_sender.lock().unwrap().take() {
            // Err means the wait task already finished
            let _ = sender.send(());
        }
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut exit_receiver = self.exit_receiver.clone();
        let waited = tokio::time::timeout(timeout, exit_receiver.wait_for(Option::is_some))
            .await
            .map(|result| result.map(|exit| *exit));
        match waited {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => *exit_receiver.borrow(),
            Err(_) => None,
        }
    }

    fn exit_events(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_receiver.clone()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.stderr_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    const WAIT: Duration = Duration::from_secs(5);

    fn sh(name: &str, script: &str) -> ServerConfig {
        ServerConfig::new(name, "sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_child_process_lifecycle() {
        let process = ChildProcess::spawn(&ServerConfig::new("cat", "cat")).unwrap();

        assert!(process.is_alive());
        assert!(process.process_id().is_some());

        // cat exits once its stdin is closed
        let stdio = process.take_stdio().unwrap();
        drop(stdio);

        let exit = process.wait(WAIT).await.expect("cat should exit on EOF");
        assert_eq!(exit.code, Some(0));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = ChildProcess::spawn(&ServerConfig::new("missing", "/nonexistent/server-binary"));
        assert!(matches!(result, Err(ProcessError::Io(_))));
    }

    #[tokio::test]
    async fn test_stdio_taken_once() {
        let process = ChildProcess::spawn(&ServerConfig::new("cat", "cat")).unwrap();

        let _stdio = process.take_stdio().unwrap();
        assert!(matches!(process.take_stdio(), Err(ProcessError::StdioTaken)));

        process.kill().unwrap();
        assert!(process.wait(WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_stderr_handler_receives_lines() {
        let stderr_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let stderr_lines_clone = Arc::clone(&stderr_lines);

        let config = sh("noisy", "echo 'error message' >&2; echo '' >&2; echo second >&2")
            .on_stderr_line(move |line| {
                if let Ok(mut lines) = stderr_lines_clone.lock() {
                    lines.push(line);
                }
            });

        let process = ChildProcess::spawn(&config).unwrap();
        process.wait(WAIT).await.unwrap();

        // The drain task may lag slightly behind the exit
        for _ in 0..50 {
            if stderr_lines.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let lines = stderr_lines.lock().unwrap();
        assert_eq!(*lines, vec!["error message".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_large_stderr_does_not_block_stdout() {
        // Far more than a pipe buffer on stderr before anything on stdout
        let config = sh(
            "chatty",
            "i=0; while [ $i -lt 2000 ]; do echo 'diagnostic line padding padding padding' >&2; i=$((i+1)); done; echo done",
        );
        let process = ChildProcess::spawn(&config).unwrap();
        let stdio = process.take_stdio().unwrap();

        let mut output = String::new();
        tokio::time::timeout(WAIT, BufReader::new(stdio.stdout).read_line(&mut output))
            .await
            .expect("stdout must not stall behind stderr")
            .unwrap();
        assert_eq!(output.trim(), "done");
    }

    #[tokio::test]
    async fn test_cwd_and_env_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh("env", "echo \"$TOOL_MODE\"; pwd")
            .cwd(dir.path())
            .env("TOOL_MODE", "validation");

        let process = ChildProcess::spawn(&config).unwrap();
        let mut stdout = process.take_stdio().unwrap().stdout;
        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();

        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("validation"));
        let reported = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_cooperative_process() {
        let process = ChildProcess::spawn(&ServerConfig::new("sleeper", "sleep").arg("30")).unwrap();

        process.terminate().unwrap();
        let exit = process.wait(WAIT).await.expect("sleep should exit on SIGTERM");
        assert_eq!(exit.code, None);
        assert_eq!(exit.to_string(), "terminated by signal");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_process_ignoring_sigterm() {
        let process = ChildProcess::spawn(&sh(
            "stubborn",
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
        ))
        .unwrap();
        let stdio = process.take_stdio().unwrap();

        // Wait until the trap is installed
        let mut line = String::new();
        BufReader::new(stdio.stdout).read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "ready");

        process.terminate().unwrap();
        assert!(process.wait(Duration::from_millis(300)).await.is_none());
        assert!(process.is_alive());

        process.kill().unwrap();
        assert!(process.wait(WAIT).await.is_some());
        assert!(!process.is_alive());

        // Signalling an exited process is a no-op
        process.terminate().unwrap();
        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_exit_events_observe_exit() {
        let process = ChildProcess::spawn(&sh("short", "exit 3")).unwrap();
        let mut events = process.exit_events();

        let exit = tokio::time::timeout(WAIT, events.wait_for(Option::is_some))
            .await
            .unwrap()
            .map(|exit| *exit)
            .unwrap();
        assert_eq!(exit, Some(ProcessExit { code: Some(3) }));
    }
}
