//! Correlate an async reply to an async request with a deadline.
//!
//! Both transports and the upstream proxy share this table: register an id
//! when a request goes out, resolve it exactly once: by a matching
//! response, by the deadline, or by teardown failing everything at once.

use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use tabbridge_core::{Error, Result};

type Entry = oneshot::Sender<Result<Value>>;

pub struct PendingRequests<K: Eq + Hash + Clone + Send + 'static> {
    inner: Arc<Mutex<HashMap<K, Entry>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> Clone for PendingRequests<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for PendingRequests<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> PendingRequests<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an outstanding request. Ids must be unique while an entry
    /// is outstanding; a duplicate replaces (and thereby drops) the old
    /// entry, which surfaces as a channel-closed failure to its waiter.
    pub async fn register(&self, id: K) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id, tx);
        rx
    }

    /// Resolve an entry. Returns false when no entry was outstanding for
    /// `id` (already resolved, timed out, or never registered).
    pub async fn complete(&self, id: &K, result: Result<Value>) -> bool {
        let entry = self.inner.lock().await.remove(id);
        match entry {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Reject every outstanding entry and clear the table. Used on forced
    /// connection teardown.
    pub async fn fail_all(&self, make_err: impl Fn() -> Error) {
        let mut map = self.inner.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(make_err()));
        }
    }

    /// Await the registered receiver, bounded by `deadline`. On expiry the
    /// entry is evicted so a late reply cannot resolve it.
    pub async fn wait(
        &self,
        id: &K,
        rx: oneshot::Receiver<Result<Value>>,
        deadline: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("reply channel closed".to_string())),
            Err(_) => {
                self.inner.lock().await.remove(id);
                Err(Error::Timeout(format!(
                    "no response within {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
