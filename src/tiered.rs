//! Tiered orchestration and the cache capability surface.
//!
//! [`TieredCache`] composes the local and remote tiers under one strict
//! ordering rule: writes and evictions always touch the remote tier first,
//! then reach local tiers — this process's included — through the
//! invalidation broadcast. A reader racing between the two steps may see a
//! stale local value for up to one local TTL; that staleness is the
//! documented trade-off of the protocol.
//!
//! [`Cache`] is the tagged variant callers hold: local-only, remote-only, or
//! tiered. Tier accessors exist only on the tiered variant.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::invalidation::{InvalidationMessage, InvalidationPublisher};
use crate::local::LocalTier;
use crate::remote::RemoteTier;
use crate::settings::TierSettings;
use crate::stats::StatsSnapshot;

/// Local tier in front of the remote tier, with the consistency protocol.
pub struct TieredCache {
    name: String,
    settings: TierSettings,
    local: Arc<LocalTier>,
    remote: Arc<RemoteTier>,
    publisher: InvalidationPublisher,
}

impl TieredCache {
    pub(crate) fn new(
        name: impl Into<String>,
        settings: TierSettings,
        local: Arc<LocalTier>,
        remote: Arc<RemoteTier>,
        publisher: InvalidationPublisher,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            local,
            remote,
            publisher,
        }
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settings this cache was created with.
    #[must_use]
    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// The in-process tier.
    #[must_use]
    pub fn local_tier(&self) -> &Arc<LocalTier> {
        &self.local
    }

    /// The shared tier.
    #[must_use]
    pub fn remote_tier(&self) -> &Arc<RemoteTier> {
        &self.remote
    }

    /// Read `key` through the tiers: local first; on a miss the remote value
    /// is backfilled into the local tier with `put_if_absent`, so a racing
    /// writer's eviction is not overwritten by a stale put.
    ///
    /// # Errors
    ///
    /// Store or codec failures from the remote tier.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        if let Some(value) = self.local.get(key).await {
            debug!(cache = %self.name, key = %key, "local hit");
            return Ok(Some(value));
        }

        let value = self.remote.get(key).await?;
        if let Some(value) = &value {
            self.local.put_if_absent(key, value.clone()).await;
            debug!(cache = %self.name, key = %key, "remote hit, backfilled local");
        }
        Ok(value)
    }

    /// Read through with a loader. The local tier is consulted without
    /// loading; on a local miss the remote tier guarantees the loader runs
    /// at most once fleet-wide, and the outcome is backfilled locally.
    ///
    /// # Errors
    ///
    /// [`CacheError::Loader`] when this caller's loader fails; store and
    /// codec failures as-is.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        if let Some(value) = self.local.get(key).await {
            debug!(cache = %self.name, key = %key, "local hit");
            return Ok(value);
        }

        let value = self.remote.get_or_load(key, loader).await?;
        self.local.put_if_absent(key, value.clone()).await;
        Ok(value)
    }

    /// Typed read-through: a hit deserializes into `T`, a miss runs the
    /// loader and caches its serialized form.
    ///
    /// # Errors
    ///
    /// [`CacheError::Serialization`] when the cached value does not match
    /// `T`; otherwise as [`Self::get_or_load`].
    pub async fn get_or_load_typed<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let value = self
            .get_or_load(key, move || {
                let fut = loader();
                async move {
                    let typed = fut.await?;
                    serde_json::to_value(&typed).map_err(anyhow::Error::from)
                }
            })
            .await?;

        serde_json::from_value(value).map_err(|e| CacheError::Serialization {
            key: key.to_owned(),
            codec: "serde_json",
            source: e.into(),
        })
    }

    /// Write through: remote tier first, then an EVICT broadcast drops every
    /// process's local copy — including this one's. The local tier is never
    /// written directly on a put.
    ///
    /// # Errors
    ///
    /// Store, codec, or publish failures.
    pub async fn put(&self, key: &str, value: &Value) -> CacheResult<()> {
        self.remote.put(key, value).await?;
        self.broadcast_evict(key).await
    }

    /// [`Self::put`] conditioned on remote absence; returns the resident
    /// value when there is one.
    ///
    /// # Errors
    ///
    /// Store, codec, or publish failures.
    pub async fn put_if_absent(&self, key: &str, value: &Value) -> CacheResult<Option<Value>> {
        let existing = self.remote.put_if_absent(key, value).await?;
        self.broadcast_evict(key).await?;
        Ok(existing)
    }

    /// Evict `key`: remote tier first, then the EVICT broadcast. Repeat
    /// calls are no-ops.
    ///
    /// # Errors
    ///
    /// Store or publish failures.
    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        self.remote.evict(key).await?;
        self.broadcast_evict(key).await
    }

    /// Clear the cache: remote tier first (where the prefix allows it), then
    /// a CLEAR broadcast. Repeat calls are no-ops.
    ///
    /// # Errors
    ///
    /// Store or publish failures.
    pub async fn clear(&self) -> CacheResult<()> {
        self.remote.clear().await?;
        self.publisher
            .publish(&InvalidationMessage::clear(&self.name))
            .await
    }

    /// Point-in-time statistics snapshot across both tiers.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::from_tiers(self.local.counters(), self.remote.counters())
    }

    async fn broadcast_evict(&self, key: &str) -> CacheResult<()> {
        self.publisher
            .publish(&InvalidationMessage::evict(&self.name, key))
            .await
    }
}

/// A registered cache: one of local-only, remote-only, or tiered.
///
/// The variants share the capability surface below; tier accessors are only
/// reachable through [`Cache::as_tiered`].
#[derive(Clone)]
pub enum Cache {
    /// In-process tier only.
    LocalOnly(Arc<LocalTier>),
    /// Shared tier only.
    RemoteOnly(Arc<RemoteTier>),
    /// Local tier in front of the remote tier.
    Tiered(Arc<TieredCache>),
}

impl Cache {
    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::LocalOnly(local) => local.name(),
            Self::RemoteOnly(remote) => remote.name(),
            Self::Tiered(tiered) => tiered.name(),
        }
    }

    /// The tiered composition, when this cache is one.
    #[must_use]
    pub fn as_tiered(&self) -> Option<&Arc<TieredCache>> {
        match self {
            Self::Tiered(tiered) => Some(tiered),
            _ => None,
        }
    }

    /// Look up `key`.
    ///
    /// # Errors
    ///
    /// Store or codec failures on the remote-backed variants.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        match self {
            Self::LocalOnly(local) => Ok(local.get(key).await),
            Self::RemoteOnly(remote) => remote.get(key).await,
            Self::Tiered(tiered) => tiered.get(key).await,
        }
    }

    /// Read through with a loader.
    ///
    /// # Errors
    ///
    /// [`CacheError::Loader`] when the loader fails; store and codec
    /// failures as-is.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        match self {
            Self::LocalOnly(local) => local.get_or_load(key, loader).await,
            Self::RemoteOnly(remote) => remote.get_or_load(key, loader).await,
            Self::Tiered(tiered) => tiered.get_or_load(key, loader).await,
        }
    }

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Store, codec, or publish failures on the remote-backed variants.
    pub async fn put(&self, key: &str, value: &Value) -> CacheResult<()> {
        match self {
            Self::LocalOnly(local) => {
                local.put(key, value.clone()).await;
                Ok(())
            }
            Self::RemoteOnly(remote) => remote.put(key, value).await,
            Self::Tiered(tiered) => tiered.put(key, value).await,
        }
    }

    /// Store `value` only when `key` is absent; returns the resident value
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Store, codec, or publish failures on the remote-backed variants.
    pub async fn put_if_absent(&self, key: &str, value: &Value) -> CacheResult<Option<Value>> {
        match self {
            Self::LocalOnly(local) => Ok(local.put_if_absent(key, value.clone()).await),
            Self::RemoteOnly(remote) => remote.put_if_absent(key, value).await,
            Self::Tiered(tiered) => tiered.put_if_absent(key, value).await,
        }
    }

    /// Evict `key`. Repeat calls are no-ops.
    ///
    /// # Errors
    ///
    /// Store or publish failures on the remote-backed variants.
    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        match self {
            Self::LocalOnly(local) => {
                local.evict(key).await;
                Ok(())
            }
            Self::RemoteOnly(remote) => remote.evict(key).await,
            Self::Tiered(tiered) => tiered.evict(key).await,
        }
    }

    /// Drop every entry. Repeat calls are no-ops.
    ///
    /// # Errors
    ///
    /// Store or publish failures on the remote-backed variants.
    pub async fn clear(&self) -> CacheResult<()> {
        match self {
            Self::LocalOnly(local) => {
                local.clear();
                Ok(())
            }
            Self::RemoteOnly(remote) => remote.clear().await,
            Self::Tiered(tiered) => tiered.clear().await,
        }
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        match self {
            Self::LocalOnly(local) => StatsSnapshot::from_local(local.counters()),
            Self::RemoteOnly(remote) => StatsSnapshot::from_remote(remote.counters()),
            Self::Tiered(tiered) => tiered.stats(),
        }
    }
}
