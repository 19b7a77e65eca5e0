//! Pending request registry
//!
//! Maps correlation ids to the one-shot slot a waiting caller is parked on.
//! An entry leaves the map exactly once: either the router resolves it with
//! a response, the caller removes it on timeout, or `fail_all` drains it
//! when the transport goes away.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;
use crate::rpc::message::Message;

/// What a waiting caller eventually receives
pub type PendingResult = Result<Message, ClientError>;

struct Inner {
    pending: HashMap<u64, oneshot::Sender<PendingResult>>,
    /// Set once the transport is gone; new registrations fail with it
    closed: Option<ClientError>,
}

/// Correlation id allocator plus the table of in-flight requests
pub struct PendingRegistry {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Allocate a fresh id and park a slot for its response
    ///
    /// The entry exists before the request is written, so a response that
    /// arrives immediately still finds it.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<PendingResult>), ClientError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        inner.pending.insert(id, sender);
        Ok((id, receiver))
    }

    /// Hand `message` to the caller waiting on `id`
    ///
    /// Gives the message back when nobody is waiting for that id.
    pub fn resolve(&self, id: u64, message: Message) -> Result<(), Message> {
        let sender = self.inner.lock().unwrap().pending.remove(&id);
        match sender {
            // Waiter already gave up
            Some(sender) if sender.is_closed() => Err(message),
            Some(sender) => {
                let _ = sender.send(Ok(message));
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Drop the entry for `id`; false if it was already resolved or removed
    pub fn remove(&self, id: u64) -> bool {
        self.inner.lock().unwrap().pending.remove(&id).is_some()
    }

    /// Whether `id` was issued by this registry but is no longer pending
    pub fn is_stale(&self, id: u64) -> bool {
        id != 0
            && id < self.next_id.load(Ordering::SeqCst)
            && !self.inner.lock().unwrap().pending.contains_key(&id)
    }

    /// Fail every pending request with `err` and refuse new ones
    ///
    /// Returns how many callers were woken.
    pub fn fail_all(&self, err: ClientError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_none() {
                inner.closed = Some(err.clone());
            }
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (id, sender) in drained {
            debug!("PendingRegistry: Failing request {} ({})", id, err);
            let _ = sender.send(Err(err.clone()));
        }
        count
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed.is_some()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
