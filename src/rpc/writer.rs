//! Outbound message writer
//!
//! Every outgoing message is encoded into one contiguous frame (header and
//! body) and handed to a single writer task that owns the server's stdin.
//! The task writes one frame at a time, so bytes of concurrently sent
//! messages never interleave, and a caller that gives up waiting can never
//! leave half a frame on the wire.

use bytes::{Bytes, BytesMut};
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Encoder;
use tracing::{error, trace};

use crate::error::ClientError;
use crate::rpc::codec::FrameCodec;
use crate::rpc::message::Message;

/// One encoded frame plus the channel used to report the write outcome
type WriteRequest = (Bytes, oneshot::Sender<Result<(), String>>);

/// Serialises outgoing messages onto the server's stdin
pub struct FrameWriter {
    /// Channel to the writer task, `None` until attached or after close
    sender: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
}

impl FrameWriter {
    /// A writer with no sink; every send fails with `TransportClosed`
    pub fn detached() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    /// Start the writer task on `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<W>(&self, sink: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_task(sink, receiver));
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.sender.lock().unwrap() = Some(sender);
    }

    /// Encode and write one message
    ///
    /// Returns once the frame has been written and flushed.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let mut buffer = BytesMut::new();
        FrameCodec::new()
            .encode(message, &mut buffer)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;

        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::transport_closed("server stdin is closed"))?;

        let (ack_sender, ack_receiver) = oneshot::channel();
        sender
            .send((buffer.freeze(), ack_sender))
            .map_err(|_| ClientError::transport_closed("server stdin is closed"))?;

        match ack_receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ClientError::transport_closed(reason)),
            Err(_) => Err(ClientError::transport_closed("writer task stopped")),
        }
    }

    /// Close the server's stdin once queued frames are written
    pub fn close(&self) {
        if self.sender.lock().unwrap().take().is_some() {
            trace!("FrameWriter: Closing server stdin");
        }
    }

    /// Whether a sink is attached and not closed
    pub fn is_open(&self) -> bool {
        self.sender
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Owns the sink; writes frames in submission order
    async fn writer_task<W>(mut sink: W, mut receiver: mpsc::UnboundedReceiver<WriteRequest>)
    where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some((frame, ack)) = receiver.recv().await {
            trace!("FrameWriter: Writing frame ({} bytes)", frame.len());

            let outcome = match sink.write_all(&frame).await {
                Ok(()) => sink.flush().await,
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                error!("Failed to write to server stdin: {}", e);
                let _ = ack.send(Err(format!("failed to write to server stdin: {e}")));
                return;
            }

            // Receiver gone means the caller stopped waiting; the frame is out anyway
            let _ = ack.send(Ok(()));
        }

        if let Err(e) = sink.shutdown().await {
            trace!("FrameWriter: stdin shutdown failed: {}", e);
        }
        trace!("FrameWriter: writer task finished");
    }
}
