//! Inbound message routing
//!
//! Every decoded message is either the answer to a request this client is
//! still waiting on, or it is unsolicited: server notifications, server
//! requests, responses with unknown ids and late responses to requests that
//! already timed out. The unsolicited ones are queued in arrival order.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};

use crate::rpc::message::Message;
use crate::rpc::registry::PendingRegistry;

/// Where a message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delivered to the caller waiting on this id
    Response(u64),
    /// Appended to the unsolicited queue
    Unsolicited,
}

/// Dispatches decoded messages to waiting callers or the unsolicited queue
pub struct Router {
    registry: Arc<PendingRegistry>,
    unsolicited: mpsc::UnboundedSender<Message>,
}

impl Router {
    /// Router bound to `registry`, plus the queue it feeds
    pub fn new(registry: Arc<PendingRegistry>) -> (Self, UnsolicitedQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let router = Self {
            registry,
            unsolicited: sender,
        };
        (router, UnsolicitedQueue::new(receiver))
    }

    pub fn route(&self, message: Message) -> Route {
        let message = match message.numeric_id() {
            Some(id) => match self.registry.resolve(id, message) {
                Ok(()) => {
                    trace!("Router: Delivered response {}", id);
                    return Route::Response(id);
                }
                Err(message) => {
                    if self.registry.is_stale(id) {
                        debug!("Router: Late response for request {} (no longer pending)", id);
                    } else {
                        debug!("Router: Message with unknown id {} queued", id);
                    }
                    message
                }
            },
            None => {
                trace!("Router: Unsolicited {}", message.label());
                message
            }
        };

        // Receiver lives as long as the owning connection; nothing to do if it is gone
        let _ = self.unsolicited.send(message);
        Route::Unsolicited
    }
}

/// Unbounded FIFO of messages that matched no pending request
pub struct UnsolicitedQueue {
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl UnsolicitedQueue {
    fn new(receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            receiver: Mutex::new(receiver),
        }
    }

    /// Wait for the next unsolicited message
    ///
    /// Returns `None` once the router is gone and the queue is empty.
    pub async fn next(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    /// Next queued message without waiting
    ///
    /// Also returns `None` while another task is parked in `next()`.
    pub fn try_next(&self) -> Option<Message> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Everything currently queued, oldest first
    pub fn drain(&self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}
