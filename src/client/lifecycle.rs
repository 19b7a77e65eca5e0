//! Client lifecycle: spawn, handshake, shutdown
//!
//! ```text
//! NotStarted -> Starting -> Initializing -> Ready -> ShuttingDown -> Stopped
//!                   \______________\___________\__________________/
//!                          (spawn/handshake failure, process exit)
//! ```
//!
//! `start` and `stop` are serialised by an async lifecycle lock. Two
//! background observers may also stop the client: the exit monitor (process
//! exited) and the reader's close handler (stdout closed).

use serde_json::{Value, json};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, warn};

use crate::client::ClientState;
use crate::client::types::InitializeResult;
use crate::config::{ClientOptions, ServerConfig};
use crate::error::ClientError;
use crate::io::{ChildProcess, ProcessExit, ProcessTransport};
use crate::log_timing;
use crate::rpc::{Message, RpcConnection};

/// How long to wait for the process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A client for one MCP server spoken to over stdio
///
/// All methods take `&self`; share the client behind an `Arc` to issue
/// requests from several tasks at once.
pub struct McpClient {
    config: ServerConfig,
    options: ClientOptions,

    /// Shared with the exit monitor and the reader's close handler
    state: Arc<Mutex<ClientState>>,

    connection: Arc<RpcConnection>,

    /// The running server, from spawn until stop
    process: Mutex<Option<Arc<dyn ProcessTransport>>>,

    /// What the server declared during the handshake
    initialize_result: Mutex<Option<InitializeResult>>,

    exit_monitor: Mutex<Option<JoinHandle<()>>>,

    /// Serialises start and stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl McpClient {
    pub fn new(config: ServerConfig, options: ClientOptions) -> Self {
        Self {
            config,
            options,
            state: Arc::new(Mutex::new(ClientState::NotStarted)),
            connection: Arc::new(RpcConnection::new()),
            process: Mutex::new(None),
            initialize_result: Mutex::new(None),
            exit_monitor: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ClientState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Server identity and capabilities from the handshake
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.initialize_result.lock().unwrap().clone()
    }

    /// OS process id of the server, while it is running
    pub fn process_id(&self) -> Option<u32> {
        self.process
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|process| process.process_id())
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Spawn the server and complete the `initialize` handshake
    ///
    /// On success the client is `Ready`. On failure the server is torn down,
    /// the client is `Stopped` and the error is `ClientError::Startup`.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.advance(ClientState::Starting)?;

        let process: Arc<dyn ProcessTransport> = match ChildProcess::spawn(&self.config) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                error!("Failed to spawn server '{}': {}", self.config.name, e);
                self.force_stopped();
                return Err(self.startup_error(e));
            }
        };

        self.bring_up(process).await
    }

    /// Same as `start`, over an already running process
    #[cfg(test)]
    pub(crate) async fn start_with(
        &self,
        process: Arc<dyn ProcessTransport>,
    ) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.advance(ClientState::Starting)?;
        self.bring_up(process).await
    }

    async fn bring_up(&self, process: Arc<dyn ProcessTransport>) -> Result<(), ClientError> {
        let start = Instant::now();
        *self.process.lock().unwrap() = Some(Arc::clone(&process));

        match self.handshake(&process).await {
            Ok(result) => {
                log_timing!(Level::DEBUG, "mcp_handshake", start.elapsed());
                match &result.server_info {
                    Some(server) => info!(
                        "Server '{}' ready: {} {} (protocol {})",
                        self.config.name,
                        server.name,
                        server.version,
                        result.protocol_version.as_deref().unwrap_or("unspecified")
                    ),
                    None => info!("Server '{}' ready", self.config.name),
                }
                debug!("Server '{}' capabilities: {}", self.config.name, result.capabilities);
                Ok(())
            }
            Err(e) => {
                error!("Server '{}' failed to start: {}", self.config.name, e);
                self.process.lock().unwrap().take();
                self.force_stopped();
                self.teardown(process.as_ref()).await;
                Err(match e {
                    ClientError::Startup { .. } => e,
                    other => self.startup_error(other),
                })
            }
        }
    }

    async fn handshake(
        &self,
        process: &Arc<dyn ProcessTransport>,
    ) -> Result<InitializeResult, ClientError> {
        let stdio = process.take_stdio().map_err(|e| self.startup_error(e))?;

        let state = Arc::clone(&self.state);
        let name = self.config.name.clone();
        self.connection.attach(
            stdio.stdout,
            stdio.stdin,
            Box::new(move |err| {
                if stop_if_live(&state).is_some_and(|previous| previous == ClientState::Ready) {
                    warn!("Server '{}' connection lost: {}", name, err);
                }
            }),
        );
        self.spawn_exit_monitor(process.exit_events());

        self.advance(ClientState::Initializing)?;
        let params = json!({
            "protocolVersion": self.options.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.options.client_name,
                "version": self.options.client_version,
            },
        });
        let result = self
            .connection
            .send_request("initialize", Some(params), self.options.initialize_timeout)
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).map_err(|e| ClientError::UnexpectedResponse {
                method: "initialize".to_string(),
                reason: e.to_string(),
            })?;

        self.connection
            .send_notification(
                "initialized",
                Some(json!({})),
                self.options.initialize_timeout,
            )
            .await?;

        *self.initialize_result.lock().unwrap() = Some(result.clone());
        self.advance(ClientState::Ready)?;
        Ok(result)
    }

    /// Watch for the process going away on its own
    fn spawn_exit_monitor(&self, mut exits: watch::Receiver<Option<ProcessExit>>) {
        let state = Arc::clone(&self.state);
        let connection = Arc::clone(&self.connection);
        let name = self.config.name.clone();

        let task = tokio::spawn(async move {
            let exit = exits
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|exit| *exit);
            let description =
                exit.map_or_else(|| "exit status unknown".to_string(), |exit| exit.to_string());

            let Some(previous) = stop_if_live(&state) else {
                debug!("Server '{}' exited ({})", name, description);
                return;
            };

            warn!(
                "Server '{}' exited unexpectedly while {} ({})",
                name, previous, description
            );
            let failed = connection.fail_pending(ClientError::transport_closed(format!(
                "server process exited ({description})"
            )));
            if failed > 0 {
                warn!("{} pending request(s) failed after server exit", failed);
            }
        });

        if let Some(previous) = self.exit_monitor.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Shut the server down, escalating from `shutdown` to terminate to kill
    ///
    /// Requests still pending fail with `TransportClosed`. Stopping a client
    /// that never started, or already stopped, does nothing.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.state();
        let process = self.process.lock().unwrap().take();
        if previous == ClientState::NotStarted
            || (process.is_none() && previous != ClientState::Ready)
        {
            debug!("Server '{}' not running, nothing to stop", self.config.name);
            return Ok(());
        }

        info!("Stopping server '{}'", self.config.name);
        let start = Instant::now();

        if previous == ClientState::Ready && self.advance(ClientState::ShuttingDown).is_ok() {
            match self
                .connection
                .send_request("shutdown", None, self.options.shutdown_grace)
                .await
            {
                Ok(_) => debug!("Server '{}' acknowledged shutdown", self.config.name),
                Err(e) => debug!(
                    "Server '{}' did not acknowledge shutdown: {}",
                    self.config.name, e
                ),
            }
        }

        if let Some(process) = process {
            self.teardown(process.as_ref()).await;
        }
        self.finish_stopped();

        if let Some(task) = self.exit_monitor.lock().unwrap().take() {
            task.abort();
        }

        log_timing!(Level::DEBUG, "mcp_stop", start.elapsed());
        info!("Server '{}' stopped", self.config.name);
        Ok(())
    }

    /// Close stdin, then wait, terminate, wait, kill; finally fail what is
    /// still pending and stop reading
    async fn teardown(&self, process: &dyn ProcessTransport) {
        let name = &self.config.name;
        self.connection.close_writer();

        if process.wait(self.options.shutdown_grace).await.is_none() {
            info!(
                "Server '{}' still running after {:?}, terminating",
                name, self.options.shutdown_grace
            );
            if let Err(e) = process.terminate() {
                warn!("Failed to terminate server '{}': {}", name, e);
            }

            if process.wait(self.options.terminate_grace).await.is_none() {
                warn!(
                    "Server '{}' still running {:?} after terminate, killing",
                    name, self.options.terminate_grace
                );
                if let Err(e) = process.kill() {
                    error!("Failed to kill server '{}': {}", name, e);
                }
                if process.wait(KILL_WAIT).await.is_none() {
                    error!("Server '{}' did not exit after kill", name);
                }
            }
        }

        let failed = self
            .connection
            .fail_pending(ClientError::transport_closed("client stopped"));
        if failed > 0 {
            warn!("{} pending request(s) failed by stop", failed);
        }
        self.connection.abort_reader();
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send `method` with the default request timeout; `Ready` only
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.send_request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.ensure_ready()?;
        self.connection.send_request(method, params, timeout).await
    }

    /// Fire-and-forget notification; `Ready` only
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        self.ensure_ready()?;
        self.connection
            .send_notification(method, params, self.options.request_timeout)
            .await
    }

    /// Wait for the next message that matched no request
    ///
    /// Returns `None` once the connection is closed and the queue drained.
    pub async fn next_unsolicited(&self) -> Option<Message> {
        self.connection.unsolicited().next().await
    }

    pub fn try_next_unsolicited(&self) -> Option<Message> {
        self.connection.unsolicited().try_next()
    }

    // ========================================================================
    // State helpers
    // ========================================================================

    pub(crate) fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            ClientState::Ready => Ok(()),
            current => Err(ClientError::InvalidState {
                current,
                expected: ClientState::Ready.as_str(),
            }),
        }
    }

    fn advance(&self, next: ClientState) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(next) {
            return Err(ClientError::InvalidState {
                current: *state,
                expected: predecessor(next),
            });
        }
        debug!("Client '{}': {} -> {}", self.config.name, *state, next);
        *state = next;
        Ok(())
    }

    fn force_stopped(&self) {
        stop_if_live(&self.state);
    }

    /// End of `stop`: `Stopped` from whatever state the client was left in
    fn finish_stopped(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != ClientState::Stopped {
            debug!("Client '{}': {} -> {}", self.config.name, *state, ClientState::Stopped);
            *state = ClientState::Stopped;
        }
    }

    fn startup_error(&self, reason: impl Display) -> ClientError {
        ClientError::Startup {
            name: self.config.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Ok(mut monitor) = self.exit_monitor.lock()
            && let Some(task) = monitor.take()
        {
            task.abort();
        }
        self.connection.abort_reader();
    }
}

/// Move to `Stopped` unless stopping is already under way or done; returns
/// the state that was left
fn stop_if_live(state: &Mutex<ClientState>) -> Option<ClientState> {
    let mut state = state.lock().unwrap();
    match *state {
        ClientState::ShuttingDown | ClientState::Stopped => None,
        previous => {
            *state = ClientState::Stopped;
            Some(previous)
        }
    }
}

/// The state a transition into `next` has to start from
fn predecessor(next: ClientState) -> &'static str {
    match next {
        ClientState::NotStarted => "none",
        ClientState::Starting => "NotStarted",
        ClientState::Initializing => "Starting",
        ClientState::Ready => "Initializing",
        ClientState::ShuttingDown => "Ready",
        ClientState::Stopped => "any running state",
    }
}
