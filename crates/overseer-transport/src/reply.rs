// Request/reply correlation over the bus.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

/// Correlates replies to outstanding requests by key (typically `call_id`).
/// A waiter registers before publishing its request; whoever observes the
/// reply resolves it.
#[derive(Clone)]
pub struct ReplyWaiters<T: Clone + Send + Sync + 'static> {
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> ReplyWaiters<T> {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, key: impl Into<String>) {
        let (tx, _rx) = watch::channel(None);
        self.waiters.write().await.insert(key.into(), tx);
    }

    /// Resolve an outstanding request; returns false when the key is unknown
    /// (late or duplicate reply).
    pub async fn resolve(&self, key: &str, value: T) -> bool {
        let waiters = self.waiters.read().await;
        match waiters.get(key) {
            Some(tx) => tx.send(Some(value)).is_ok(),
            None => false,
        }
    }

    /// Wait for the reply, or `None` on cancellation.
    pub async fn wait(
        &self,
        key: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Option<T> {
        let mut rx = {
            let waiters = self.waiters.read().await;
            waiters.get(key).map(|tx| tx.subscribe())?
        };
        let immediate = rx.borrow().clone();
        if let Some(value) = immediate {
            self.waiters.write().await.remove(key);
            return Some(value);
        }
        let value = tokio::select! {
            _ = cancel.cancelled() => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    rx.borrow().clone()
                } else {
                    None
                }
            }
        };
        self.waiters.write().await.remove(key);
        value
    }

    pub async fn forget(&self, key: &str) {
        self.waiters.write().await.remove(key);
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ReplyWaiters<T> {
    fn default() -> Self {
        Self::new()
    }
}
