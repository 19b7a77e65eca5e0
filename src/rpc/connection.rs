//! Request/response correlation over one server connection
//!
//! `RpcConnection` ties the pieces together: ids and wait slots from the
//! registry, the frame writer on the server's stdin, and a background reader
//! task that decodes the server's stdout and routes each message.

use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{Level, debug, warn};

use crate::error::ClientError;
use crate::rpc::codec::FrameCodec;
use crate::rpc::message::Message;
use crate::rpc::registry::PendingRegistry;
use crate::rpc::router::{Router, UnsolicitedQueue};
use crate::rpc::writer::FrameWriter;
use crate::{log_rpc_message, log_timing};

/// Called once by the reader task when the server's stdout is gone
pub type CloseHandler = Box<dyn FnOnce(ClientError) + Send + 'static>;

pub struct RpcConnection {
    registry: Arc<PendingRegistry>,
    writer: FrameWriter,
    unsolicited: UnsolicitedQueue,
    /// Handed to the reader task on attach
    router: Mutex<Option<Router>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcConnection {
    pub fn new() -> Self {
        let registry = Arc::new(PendingRegistry::new());
        let (router, unsolicited) = Router::new(Arc::clone(&registry));
        Self {
            registry,
            writer: FrameWriter::detached(),
            unsolicited,
            router: Mutex::new(Some(router)),
            reader_task: Mutex::new(None),
        }
    }

    /// Wire the connection to the server's streams and start the reader task
    ///
    /// `on_close` runs after every pending request has been failed. A
    /// connection can only be attached once; later calls are ignored.
    pub fn attach<R, W>(&self, stdout: R, stdin: W, on_close: CloseHandler)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let Some(router) = self.router.lock().unwrap().take() else {
            warn!("RpcConnection: attach called twice, ignoring");
            return;
        };

        self.writer.attach(stdin);
        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(Self::reader_task(stdout, router, registry, on_close));
        *self.reader_task.lock().unwrap() = Some(task);
    }

    /// Send a request and wait for its response
    ///
    /// `timeout` covers both writing the request and waiting for the answer.
    /// Returns the response's `result` (JSON null if absent). An `error`
    /// member becomes `ClientError::Remote` with the payload untouched.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start) + timeout;
        let (id, mut receiver) = self.registry.register()?;
        let request = Message::request(id, method, params);

        log_rpc_message!(Level::DEBUG, "outgoing", method, &request);

        match tokio::time::timeout_at(deadline, self.writer.send(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.registry.remove(id);
                return Err(e);
            }
            Err(_) => {
                // The frame stays queued; an answer to it would arrive as a late response
                self.registry.remove(id);
                warn!(
                    "Request '{}' (id {}) could not be written within {:?}",
                    method, id, timeout
                );
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    elapsed: start.elapsed(),
                });
            }
        }

        let waited = tokio::time::timeout_at(deadline, &mut receiver).await;
        let delivered = match waited {
            Ok(Ok(delivered)) => delivered,
            Ok(Err(_)) => Err(ClientError::transport_closed("response channel closed")),
            Err(_) => {
                if self.registry.remove(id) {
                    warn!("Request '{}' (id {}) timed out after {:?}", method, id, timeout);
                    return Err(ClientError::Timeout {
                        method: method.to_string(),
                        elapsed: start.elapsed(),
                    });
                }
                // The router (or a transport failure) took the entry first and
                // is about to signal; that outcome wins over the timeout
                receiver.await.unwrap_or_else(|_| {
                    Err(ClientError::transport_closed("response channel closed"))
                })
            }
        };

        // No-op unless the caller was woken by something other than the router
        self.registry.remove(id);

        let response = delivered?;
        log_timing!(Level::DEBUG, format!("rpc_request_{method}"), start.elapsed());
        Self::extract_result(response)
    }

    /// Send a notification; nothing is registered and nothing is awaited
    /// beyond the write itself, which must finish within `timeout`
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let start = Instant::now();
        let notification = Message::notification(method, params);
        log_rpc_message!(Level::DEBUG, "outgoing", method, &notification);

        tokio::time::timeout(timeout, self.writer.send(&notification))
            .await
            .map_err(|_| ClientError::Timeout {
                method: method.to_string(),
                elapsed: start.elapsed(),
            })?
    }

    /// Queue of messages that matched no pending request
    pub fn unsolicited(&self) -> &UnsolicitedQueue {
        &self.unsolicited
    }

    /// Fail everything in flight and refuse new requests
    pub fn fail_pending(&self, err: ClientError) -> usize {
        self.registry.fail_all(err)
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Close the server's stdin after queued frames are written
    pub fn close_writer(&self) {
        self.writer.close();
    }

    /// Stop reading from the server
    pub fn abort_reader(&self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn extract_result(response: Message) -> Result<Value, ClientError> {
        if let Some(payload) = response.error {
            return Err(ClientError::Remote { payload });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Decode stdout until it closes, then fail whatever is still pending
    async fn reader_task<R>(
        stdout: R,
        router: Router,
        registry: Arc<PendingRegistry>,
        on_close: CloseHandler,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        let mut frames = FramedRead::new(stdout, FrameCodec::new());

        let reason = loop {
            match frames.next().await {
                Some(Ok(message)) => {
                    log_rpc_message!(Level::DEBUG, "incoming", message.label(), &message);
                    router.route(message);
                }
                Some(Err(e)) => break format!("failed to read server stdout: {e}"),
                None => break "server closed its stdout".to_string(),
            }
        };

        debug!("RpcConnection: Reader stopping ({})", reason);
        let err = ClientError::transport_closed(reason);
        let failed = registry.fail_all(err.clone());
        if failed > 0 {
            warn!("{} pending request(s) failed: {}", failed, err);
        }
        on_close(err);
    }
}

impl Default for RpcConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader_task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}
