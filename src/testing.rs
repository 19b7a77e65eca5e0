//! In-memory test doubles
//!
//! `FakeProcess` stands in for a spawned server: its stdio is a pair of
//! `tokio::io::duplex` pipes whose far ends are driven by a
//! `ScriptedServer`, and its exit is whatever the test says it is.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::codec::{Encoder, FramedRead};

use crate::client::McpClient;
use crate::config::{ClientOptions, ServerConfig};
use crate::io::{ProcessError, ProcessExit, ProcessStdio, ProcessTransport};
use crate::rpc::{FrameCodec, Message};

/// How long scripted expectations wait before failing the test
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size of each in-memory stdio pipe
pub const PIPE_CAPACITY: usize = 64 * 1024;

// ============================================================================
// Fake Process
// ============================================================================

/// What the fake does when asked to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateBehavior {
    /// Exits on SIGTERM
    Exit,
    /// Ignores SIGTERM; only kill stops it
    Ignore,
}

pub struct FakeProcess {
    stdio: Mutex<Option<ProcessStdio>>,
    exit_sender: watch::Sender<Option<ProcessExit>>,
    on_terminate: TerminateBehavior,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl FakeProcess {
    /// A fake that exits when terminated, plus the server end of its pipes
    pub fn new() -> (Self, ScriptedServer) {
        Self::with_terminate_behavior(TerminateBehavior::Exit)
    }

    pub fn with_terminate_behavior(on_terminate: TerminateBehavior) -> (Self, ScriptedServer) {
        let (client_stdout, server_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_stdin, client_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_sender, _) = watch::channel(None);

        let process = Self {
            stdio: Mutex::new(Some(ProcessStdio {
                stdin: Box::new(client_stdin),
                stdout: Box::new(client_stdout),
            })),
            exit_sender,
            on_terminate,
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
        };
        (process, ScriptedServer::new(server_stdin, server_stdout))
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self, code: Option<i32>) {
        self.exit_sender.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(ProcessExit { code });
            true
        });
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessTransport for FakeProcess {
    fn take_stdio(&self) -> Result<ProcessStdio, ProcessError> {
        self.stdio
            .lock()
            .unwrap()
            .take()
            .ok_or(ProcessError::StdioTaken)
    }

    fn process_id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.exit_sender.borrow().is_none()
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.on_terminate == TerminateBehavior::Exit {
            self.exit(None);
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.exit(None);
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut exits = self.exit_sender.subscribe();
        tokio::time::timeout(timeout, exits.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(|result| result.ok().and_then(|exit| *exit))
    }

    fn exit_events(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_sender.subscribe()
    }
}

// ============================================================================
// Scripted Server
// ============================================================================

/// Server side of an in-memory connection, driven step by step by a test
pub struct ScriptedServer {
    frames: FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>,
    sink: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ScriptedServer {
    /// `reader` carries what the client wrote, `writer` what the client reads
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            frames: FramedRead::new(Box::new(reader), FrameCodec::new()),
            sink: Box::new(writer),
        }
    }

    /// Next message from the client, `None` once the client closed stdin
    pub async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(EXPECT_TIMEOUT, self.frames.next())
            .await
            .expect("timed out waiting for a client message")
            .map(|frame| frame.expect("client wrote an unreadable frame"))
    }

    pub async fn expect_request(&mut self, method: &str) -> Message {
        let message = self
            .next_message()
            .await
            .unwrap_or_else(|| panic!("client closed before sending '{method}'"));
        assert_eq!(message.method.as_deref(), Some(method), "unexpected message: {message:?}");
        assert!(message.id.is_some(), "'{method}' was sent without an id");
        message
    }

    pub async fn expect_notification(&mut self, method: &str) -> Message {
        let message = self
            .next_message()
            .await
            .unwrap_or_else(|| panic!("client closed before sending '{method}'"));
        assert_eq!(message.method.as_deref(), Some(method), "unexpected message: {message:?}");
        assert!(message.id.is_none(), "'{method}' carried an id");
        message
    }

    /// Write one length-prefixed frame
    pub async fn send(&mut self, message: &Message) {
        let mut buffer = BytesMut::new();
        FrameCodec::new().encode(message, &mut buffer).unwrap();
        self.send_raw(&buffer).await;
    }

    /// Write bytes exactly as given
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.sink.write_all(bytes).await.unwrap();
        self.sink.flush().await.unwrap();
    }

    pub async fn respond(&mut self, id: Value, result: Value) {
        self.send(&Message::response(id, result)).await;
    }

    pub async fn respond_error(&mut self, id: Value, code: i64, message: &str) {
        self.send(&Message::error_response(id, code, message)).await;
    }

    /// Answer `initialize` and consume `initialized`; returns the initialize request
    pub async fn complete_handshake(&mut self) -> Message {
        let request = self.expect_request("initialize").await;
        self.respond(request.id.clone().unwrap(), initialize_result("scripted-server"))
            .await;
        self.expect_notification("initialized").await;
        request
    }
}

/// A typical `initialize` result
pub fn initialize_result(server_name: &str) -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {"listChanged": false}, "resources": {}},
        "serverInfo": {"name": server_name, "version": "0.3.1"}
    })
}

// ============================================================================
// Client Fixtures
// ============================================================================

/// Short timeouts so escalation paths finish quickly
pub fn test_options() -> ClientOptions {
    ClientOptions::default()
        .request_timeout(Duration::from_secs(2))
        .initialize_timeout(Duration::from_secs(2))
        .grace_periods(Duration::from_millis(250), Duration::from_millis(250))
}

/// A client that completed the handshake against a `FakeProcess`
pub async fn ready_client(
    on_terminate: TerminateBehavior,
) -> (Arc<McpClient>, Arc<FakeProcess>, ScriptedServer) {
    let (fake, mut server) = FakeProcess::with_terminate_behavior(on_terminate);
    let fake = Arc::new(fake);
    let client = Arc::new(McpClient::new(
        ServerConfig::new("fake", "fake-server"),
        test_options(),
    ));

    let starting = {
        let client = Arc::clone(&client);
        let fake = Arc::clone(&fake);
        tokio::spawn(async move { client.start_with(fake).await })
    };
    server.complete_handshake().await;
    starting.await.unwrap().unwrap();

    (client, fake, server)
}
