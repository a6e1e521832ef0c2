//! Shared Redis tier: the fleet's source of truth.
//!
//! `get_or_load` gives stampede protection across the whole fleet: at most
//! one loader runs per missing key, guarded by a short-lease distributed
//! mutex, while other callers park on a per-key waiter and re-check. Hits
//! whose remaining TTL has entered the preload window are refreshed ahead of
//! expiry — softly (TTL extended as-is) or hard (recomputed in the
//! background), depending on the settings.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::codecs::Codec;
use crate::error::{CacheError, CacheResult};
use crate::lock::DistributedMutex;
use crate::pool::RefreshPool;
use crate::settings::RemoteSettings;
use crate::stats::CacheCounters;
use crate::store::RedisStore;
use crate::waiter::WaiterRegistry;

/// How long a caller parks per load-loop iteration while another instance
/// holds the load lock.
const WAIT_TIME: Duration = Duration::from_millis(500);
/// Lease on the load lock; a crashed loader's lock expires on its own.
const LOAD_LOCK_LEASE: Duration = Duration::from_secs(10);
/// Lease on the refresh lock.
const REFRESH_LOCK_LEASE: Duration = Duration::from_secs(60);
/// Cached logical nulls live this fraction of the configured TTL.
const NULL_TTL_DIVISOR: u64 = 10;

/// TTL-based cache over the shared store.
pub struct RemoteTier {
    name: String,
    settings: RemoteSettings,
    store: RedisStore,
    codec: Arc<dyn Codec>,
    waiters: WaiterRegistry,
    pool: Arc<RefreshPool>,
    counters: CacheCounters,
}

impl RemoteTier {
    /// Build a tier from its settings.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        settings: RemoteSettings,
        store: RedisStore,
        codec: Arc<dyn Codec>,
        pool: Arc<RefreshPool>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            store,
            codec,
            waiters: WaiterRegistry::new(),
            pool,
            counters: CacheCounters::new(),
        }
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This tier's settings.
    #[must_use]
    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// This tier's counters.
    #[must_use]
    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Full store key, name-prefixed when `use_prefix` is on.
    fn full_key(&self, key: &str) -> String {
        if self.settings.use_prefix {
            format!("{}:{}", self.name, key)
        } else {
            key.to_owned()
        }
    }

    /// Look up `key`. `None` means absent, `Some(Value::Null)` a cached
    /// logical null.
    ///
    /// # Errors
    ///
    /// Store or codec failures.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.counters.add_request_count(1);
        let full = self.full_key(key);
        debug!(key = %full, "remote get");
        self.read(&full).await
    }

    async fn read(&self, full_key: &str) -> CacheResult<Option<Value>> {
        match self.store.get(full_key).await? {
            Some(bytes) => Ok(Some(self.codec.decode(full_key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Read-through lookup. A hit may additionally schedule refresh-ahead;
    /// a miss enters the single-flight load path, so the loader runs at most
    /// once fleet-wide per missing key.
    ///
    /// # Errors
    ///
    /// [`CacheError::Loader`] when this caller's loader fails (parked
    /// callers are woken and retry on their own); store and codec failures
    /// are surfaced as-is.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        self.counters.add_request_count(1);
        let full = self.full_key(key);

        if let Some(value) = self.read(&full).await? {
            self.maybe_refresh(&full, loader).await;
            return Ok(value);
        }

        self.load_with_lock(&full, loader).await
    }

    /// Store `value` under `key` with the configured TTL, applying the
    /// null-store policy for logical nulls.
    ///
    /// # Errors
    ///
    /// Store or codec failures.
    pub async fn put(&self, key: &str, value: &Value) -> CacheResult<()> {
        let full = self.full_key(key);
        debug!(key = %full, "remote put");
        store_value(&self.store, self.codec.as_ref(), &self.settings, &full, value).await
    }

    /// Store only when `key` is currently absent; returns the resident value
    /// otherwise. Check-then-set, not atomic: two racing callers can both
    /// observe absence, in which case the later write wins.
    ///
    /// # Errors
    ///
    /// Store or codec failures.
    pub async fn put_if_absent(&self, key: &str, value: &Value) -> CacheResult<Option<Value>> {
        if let Some(existing) = self.get(key).await? {
            return Ok(Some(existing));
        }
        self.put(key, value).await?;
        Ok(None)
    }

    /// Delete `key`. Repeat calls are no-ops.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        let full = self.full_key(key);
        debug!(key = %full, "remote evict");
        self.store.del(&full).await
    }

    /// Drop every entry of this cache. Effective only when name-prefixing is
    /// on; without the prefix this cache's keys cannot be told apart in the
    /// shared keyspace, and the call is a logged no-op.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn clear(&self) -> CacheResult<()> {
        if !self.settings.use_prefix {
            warn!(cache = %self.name, "clear skipped: name prefix disabled");
            return Ok(());
        }
        let keys = self.store.scan(&format!("{}:*", self.name)).await?;
        if !keys.is_empty() {
            let removed = self.store.del_many(&keys).await?;
            debug!(cache = %self.name, removed, "remote clear");
        }
        Ok(())
    }

    /// Single-flight load. Each iteration re-reads the key (another instance
    /// may have finished the load), then races for the load lock; losers
    /// park for up to [`WAIT_TIME`] and loop. The loop has no iteration cap.
    async fn load_with_lock<F, Fut>(&self, full_key: &str, loader: F) -> CacheResult<Value>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let lock_key = format!("{full_key}:load");

        loop {
            if let Some(value) = self.read(full_key).await? {
                debug!(key = %full_key, "found by re-read after lock wait");
                return Ok(value);
            }

            let mut lock = DistributedMutex::new(&self.store, &lock_key, LOAD_LOCK_LEASE);
            if lock.try_acquire().await? {
                let result = load_and_store(
                    &self.store,
                    self.codec.as_ref(),
                    &self.counters,
                    &self.settings,
                    full_key,
                    &loader,
                )
                .await;
                // Wake parked callers whatever the outcome: on failure they
                // retry the load themselves instead of timing out.
                self.waiters.signal_all(full_key);
                if let Err(e) = lock.release().await {
                    debug!(key = %full_key, error = %e, "load lock release failed");
                }
                return result;
            }

            debug!(key = %full_key, "load lock held elsewhere, parking");
            self.waiters.wait(full_key, WAIT_TIME).await;
        }
    }

    /// On a hit, check the remaining TTL and refresh when it has entered the
    /// preload window. Never propagates an error: the caller already holds a
    /// valid value.
    async fn maybe_refresh<F, Fut>(&self, full_key: &str, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let ttl = match self.store.ttl_secs(full_key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(key = %full_key, error = %e, "ttl probe failed, skipping refresh");
                return;
            }
        };
        if !within_preload(ttl, self.settings.preload_secs) {
            return;
        }

        if self.settings.force_refresh {
            debug!(key = %full_key, remaining_secs = ttl, "hard refresh");
            self.hard_refresh(full_key, loader);
        } else {
            debug!(key = %full_key, remaining_secs = ttl, "soft refresh");
            self.soft_refresh(full_key).await;
        }
    }

    /// Soft refresh: reset the stored TTL to the full window without
    /// recomputation. One instance wins the refresh lock; the rest skip.
    async fn soft_refresh(&self, full_key: &str) {
        let mut lock = DistributedMutex::new(
            &self.store,
            &refresh_lock_key(full_key),
            REFRESH_LOCK_LEASE,
        );
        match lock.try_acquire().await {
            Ok(true) => {
                if let Err(e) = self.store.expire(full_key, self.settings.ttl()).await {
                    warn!(key = %full_key, error = %e, "soft refresh failed");
                }
                if let Err(e) = lock.release().await {
                    debug!(key = %full_key, error = %e, "refresh lock release failed");
                }
            }
            Ok(false) => debug!(key = %full_key, "refresh lock contended, skipping cycle"),
            Err(e) => warn!(key = %full_key, error = %e, "refresh lock attempt failed"),
        }
    }

    /// Hard refresh: recompute in the background. The triggering caller is
    /// never blocked; when the pool is saturated the task is dropped and the
    /// entry expires on schedule.
    fn hard_refresh<F, Fut>(&self, full_key: &str, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let store = self.store.clone();
        let codec = Arc::clone(&self.codec);
        let counters = self.counters.clone();
        let settings = self.settings;
        let full_key = full_key.to_owned();

        self.pool.try_run(async move {
            let mut lock =
                DistributedMutex::new(&store, &refresh_lock_key(&full_key), REFRESH_LOCK_LEASE);
            match lock.try_acquire().await {
                Ok(true) => {
                    // Re-check now that time has passed; another instance may
                    // already have refreshed the entry.
                    match store.ttl_secs(&full_key).await {
                        Ok(ttl) if within_preload(ttl, settings.preload_secs) => {
                            if let Err(e) = load_and_store(
                                &store,
                                codec.as_ref(),
                                &counters,
                                &settings,
                                &full_key,
                                &loader,
                            )
                            .await
                            {
                                warn!(key = %full_key, error = %e, "background refresh failed");
                            }
                        }
                        Ok(_) => debug!(key = %full_key, "entry already refreshed"),
                        Err(e) => warn!(key = %full_key, error = %e, "ttl re-check failed"),
                    }
                    if let Err(e) = lock.release().await {
                        debug!(key = %full_key, error = %e, "refresh lock release failed");
                    }
                }
                Ok(false) => debug!(key = %full_key, "refresh lock contended, skipping cycle"),
                Err(e) => warn!(key = %full_key, error = %e, "refresh lock attempt failed"),
            }
        });
    }
}

fn refresh_lock_key(full_key: &str) -> String {
    format!("{full_key}:refresh")
}

/// A positive remaining TTL at or below the preload window.
fn within_preload(ttl_secs: i64, preload_secs: u64) -> bool {
    ttl_secs > 0 && u64::try_from(ttl_secs).unwrap_or(u64::MAX) <= preload_secs
}

/// Run the loader, store its result, and account for it in the counters.
async fn load_and_store<F, Fut>(
    store: &RedisStore,
    codec: &dyn Codec,
    counters: &CacheCounters,
    settings: &RemoteSettings,
    full_key: &str,
    loader: &F,
) -> CacheResult<Value>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    let started = Instant::now();
    counters.add_cached_request_count(1);

    let value = loader().await.map_err(|e| CacheError::Loader {
        key: full_key.to_owned(),
        source: e,
    })?;
    store_value(store, codec, settings, full_key, &value).await?;

    let cost = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    counters.add_cached_request_time(cost);
    debug!(key = %full_key, cost_ms = cost, "loader executed");
    Ok(value)
}

/// Write `value` with the configured TTL. A logical null either becomes a
/// short-lived marker entry or deletes the key, per the null-store policy.
async fn store_value(
    store: &RedisStore,
    codec: &dyn Codec,
    settings: &RemoteSettings,
    full_key: &str,
    value: &Value,
) -> CacheResult<()> {
    if value.is_null() {
        if settings.allow_null_values {
            let ttl = Duration::from_secs((settings.ttl_secs / NULL_TTL_DIVISOR).max(1));
            let bytes = codec.encode(full_key, value)?;
            return store.set_ex(full_key, &bytes, ttl).await;
        }
        // Null-caching off: a null result removes whatever was stored.
        return store.del(full_key).await;
    }

    let bytes = codec.encode(full_key, value)?;
    store.set_ex(full_key, &bytes, settings.ttl()).await
}
