//! Per-key wait/signal used to coalesce concurrent remote loads.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Parks callers per key until the key is signalled or a timeout fires.
/// Keys are independent: one key's waiters never contend with another's.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    parked: DashMap<String, Arc<Notify>>,
}

impl WaiterRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until `signal_all` for this key or until `timeout`, whichever
    /// comes first.
    pub async fn wait(&self, key: &str, timeout: Duration) {
        let notify = self
            .parked
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
    }

    /// Wake every caller currently parked on `key`.
    pub fn signal_all(&self, key: &str) {
        if let Some((_, notify)) = self.parked.remove(key) {
            notify.notify_waiters();
        }
    }
}
