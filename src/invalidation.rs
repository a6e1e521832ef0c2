//! Cross-instance invalidation over a fixed Redis Pub/Sub channel.
//!
//! Every instance publishes coherence messages on one channel and runs one
//! listener that drops local entries in response. Delivery is at-least-once
//! and unordered; EVICT and CLEAR are idempotent, so duplicates are safe
//! no-ops. Malformed payloads are logged and dropped, never fatal.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::registry::CacheRegistry;
use crate::store::RedisStore;
use crate::tiered::Cache;

/// The channel every instance publishes and listens on.
pub const INVALIDATION_CHANNEL: &str = "strata-cache:invalidate";

/// Source marker for messages that did not originate from a cache's own
/// write path (the write path already deleted the remote entry itself).
/// Listeners seeing this marker drop the remote entry in addition to the
/// local one.
pub const OUT_OF_BAND_SOURCE: &str = "out-of-band";

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Drop one key.
    Evict,
    /// Drop every entry of the cache.
    Clear,
}

/// Coherence message, serialized as camelCase JSON on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    /// Name of the cache the message applies to (all settings variants).
    pub cache_name: String,
    /// The key to drop; `None` for CLEAR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Message kind.
    pub message_type: MessageType,
    /// Origin marker; see [`OUT_OF_BAND_SOURCE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InvalidationMessage {
    /// An EVICT for one key.
    #[must_use]
    pub fn evict(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: Some(key.into()),
            message_type: MessageType::Evict,
            source: None,
        }
    }

    /// A CLEAR for a whole cache.
    #[must_use]
    pub fn clear(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: None,
            message_type: MessageType::Clear,
            source: None,
        }
    }

    /// Attach an origin marker.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Sends invalidation messages on the fixed channel.
#[derive(Clone)]
pub struct InvalidationPublisher {
    store: RedisStore,
    channel: String,
}

impl InvalidationPublisher {
    pub(crate) fn new(store: RedisStore, channel: String) -> Self {
        Self { store, channel }
    }

    /// Serialize and publish `message` to every subscribed instance.
    ///
    /// # Errors
    ///
    /// Store failures; serialization of the fixed message shape cannot
    /// realistically fail but is surfaced rather than swallowed.
    pub async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let payload = serde_json::to_string(message).map_err(|e| CacheError::Serialization {
            key: message.cache_name.clone(),
            codec: "serde_json",
            source: e.into(),
        })?;
        self.store.publish(&self.channel, &payload).await?;
        debug!(channel = %self.channel, payload = %payload, "invalidation published");
        Ok(())
    }
}

/// Per-process listener: subscribes to the channel and dispatches messages
/// into the registry. Reconnects with a 5s pause on connection loss.
pub struct InvalidationListener {
    store: RedisStore,
    registry: Arc<CacheRegistry>,
    channel: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl InvalidationListener {
    pub(crate) fn new(store: RedisStore, registry: Arc<CacheRegistry>, channel: String) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            registry,
            channel,
            shutdown_tx,
        }
    }

    /// Start the listener task.
    pub fn start(&self) -> JoinHandle<()> {
        let client = self.store.client().clone();
        let channel = self.channel.clone();
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("invalidation listener shutting down");
                    break;
                }

                match run_listener(&client, &channel, &registry, &mut shutdown_rx).await {
                    Ok(()) => {
                        info!("invalidation listener stopped");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "invalidation listener error, reconnecting in 5s");
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(5)) => {}
                            _ = shutdown_rx.recv() => {
                                info!("invalidation listener shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Signal the listener task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_listener(
    client: &redis::Client,
    channel: &str,
    registry: &Arc<CacheRegistry>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> CacheResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel = %channel, "subscribed to invalidation channel");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            message = stream.next() => {
                let Some(message) = message else {
                    return Err(CacheError::RemoteStore(redis::RedisError::from((
                        redis::ErrorKind::Io,
                        "pub/sub message stream ended",
                    ))));
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "unreadable invalidation payload, dropping");
                        continue;
                    }
                };
                match serde_json::from_str::<InvalidationMessage>(&payload) {
                    Ok(parsed) => apply(registry, &parsed).await,
                    Err(e) => warn!(payload = %payload, error = %e, "malformed invalidation message, dropping"),
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// Dispatch one message into every cache registered under its name.
async fn apply(registry: &Arc<CacheRegistry>, message: &InvalidationMessage) {
    let out_of_band = message.source.as_deref() == Some(OUT_OF_BAND_SOURCE);

    match message.message_type {
        MessageType::Evict => {
            let Some(key) = message.key.as_deref() else {
                warn!(cache = %message.cache_name, "EVICT without a key, dropping");
                return;
            };
            for cache in registry.get_all(&message.cache_name) {
                match &cache {
                    Cache::Tiered(tiered) => {
                        if out_of_band {
                            if let Err(e) = tiered.remote_tier().evict(key).await {
                                warn!(cache = %message.cache_name, key = %key, error = %e, "remote evict from broadcast failed");
                            }
                        }
                        tiered.local_tier().evict(key).await;
                    }
                    Cache::LocalOnly(local) => local.evict(key).await,
                    Cache::RemoteOnly(remote) => {
                        if out_of_band {
                            if let Err(e) = remote.evict(key).await {
                                warn!(cache = %message.cache_name, key = %key, error = %e, "remote evict from broadcast failed");
                            }
                        }
                    }
                }
            }
            debug!(cache = %message.cache_name, key = %key, "local entry dropped by broadcast");
        }
        MessageType::Clear => {
            for cache in registry.get_all(&message.cache_name) {
                match &cache {
                    Cache::Tiered(tiered) => {
                        if out_of_band {
                            if let Err(e) = tiered.remote_tier().clear().await {
                                warn!(cache = %message.cache_name, error = %e, "remote clear from broadcast failed");
                            }
                        }
                        tiered.local_tier().clear();
                    }
                    Cache::LocalOnly(local) => local.clear(),
                    Cache::RemoteOnly(remote) => {
                        if out_of_band {
                            if let Err(e) = remote.clear().await {
                                warn!(cache = %message.cache_name, error = %e, "remote clear from broadcast failed");
                            }
                        }
                    }
                }
            }
            debug!(cache = %message.cache_name, "local tier cleared by broadcast");
        }
    }
}
