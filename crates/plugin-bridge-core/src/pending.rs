//! Registry of outstanding request/response correlations.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BridgeError;

type Reply = Result<Value, BridgeError>;

/// Outstanding requests keyed by correlation id.
///
/// Each id resolves at most once: the first matching response removes the
/// entry, and anything arriving later for that id is reported as unmatched.
pub struct PendingRequests<K> {
    inner: Mutex<HashMap<K, oneshot::Sender<Reply>>>,
}

impl<K> Default for PendingRequests<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> PendingRequests<K>
where
    K: Eq + Hash + Clone + Debug,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding request.
    ///
    /// # Errors
    /// Returns a protocol error if `id` is already outstanding.
    pub fn register(&self, id: K) -> Result<oneshot::Receiver<Reply>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            return Err(BridgeError::Protocol(format!(
                "correlation id {id:?} is already outstanding"
            )));
        }
        map.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a response. Returns false if nothing was waiting on `id`.
    pub fn resolve(&self, id: &K, reply: Reply) -> bool {
        let sender = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        sender.is_some_and(|tx| tx.send(reply).is_ok())
    }

    /// Drop an outstanding request without answering it.
    pub fn forget(&self, id: &K) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Reject every outstanding request with `err`. Returns how many were rejected.
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        let drained: Vec<_> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the reply to `id`, giving up at `timeout`.
    ///
    /// On timeout the id is forgotten so a late response is discarded.
    ///
    /// # Errors
    /// Returns the remote error, a timeout, or a connection error if the
    /// registry was dropped.
    pub async fn wait(
        &self,
        id: &K,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
        operation: &str,
    ) -> Reply {
        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BridgeError::Connection(format!(
                "{operation}: connection closed before a response arrived"
            ))),
            Err(_) => {
                self.forget(id);
                Err(BridgeError::timeout(operation, started.elapsed()))
            }
        }
    }
}
