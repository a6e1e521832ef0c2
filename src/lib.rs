//! Strata Cache
//!
//! A two-tier read-through cache for fleets of application instances:
//! - **Local tier**: bounded in-process cache (Moka), per-cache TTL
//! - **Remote tier**: shared Redis cache, the fleet's source of truth
//! - **Single-flight loading**: at most one loader runs per missing key
//!   fleet-wide, guarded by a best-effort distributed lease lock
//! - **Refresh-ahead**: entries nearing expiry are renewed before eviction,
//!   softly (TTL extended) or hard (recomputed in the background)
//! - **Cross-instance invalidation**: writes and evictions broadcast on one
//!   Redis Pub/Sub channel so every instance drops its stale local copy
//! - **Stats aggregation**: per-cache counters merged into durable records
//!   across processes under a distributed mutex
//!
//! # Quick start
//!
//! ```rust,no_run
//! use strata_cache::{CacheSystem, TierSettings};
//!
//! #[tokio::main]
//! async fn main() -> strata_cache::CacheResult<()> {
//!     let system = CacheSystem::new().await?;
//!     let users = system.cache("users", &TierSettings::default());
//!
//!     let user = users
//!         .get_or_load("u:1", || async {
//!             // Expensive lookup, e.g. a database query.
//!             Ok(serde_json::json!({"id": 1, "name": "alice"}))
//!         })
//!         .await?;
//!     tracing::info!(?user, "loaded through the tiers");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Consistency protocol
//!
//! ```text
//! read:   Local ──miss──▶ Remote ──miss──▶ loader (once per fleet)
//! write:  Remote first, then EVICT broadcast ──▶ every Local tier
//! ```
//!
//! The remote tier is mutated before any local-side effect; local copies —
//! including the writing process's own — drop via the broadcast. A reader
//! racing between those two steps can see a stale local value for at most
//! one local TTL.

use std::sync::Arc;

use tokio::task::JoinHandle;

pub mod builder;
pub mod codecs;
pub mod error;
pub mod invalidation;
pub mod local;
pub mod lock;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod settings;
pub mod stats;
pub mod store;
pub mod tiered;
pub mod waiter;

pub use builder::CacheSystemBuilder;
pub use codecs::{Codec, JsonCodec};
pub use error::{CacheError, CacheResult};
pub use invalidation::{
    INVALIDATION_CHANNEL, InvalidationListener, InvalidationMessage, InvalidationPublisher,
    MessageType, OUT_OF_BAND_SOURCE,
};
pub use local::LocalTier;
pub use lock::DistributedMutex;
pub use pool::RefreshPool;
pub use registry::CacheRegistry;
pub use remote::RemoteTier;
pub use settings::{LocalSettings, RemoteSettings, TierMode, TierSettings};
pub use stats::{CacheCounters, CacheStatsRecord, StatsAggregator, StatsSnapshot};
pub use store::RedisStore;
pub use tiered::{Cache, TieredCache};
pub use waiter::WaiterRegistry;

#[cfg(feature = "msgpack")]
pub use codecs::MsgpackCodec;

/// Main entry point: the store connection, the cache registry, and the
/// background machinery (invalidation listener, stats aggregator, refresh
/// worker pool) wired together.
pub struct CacheSystem {
    pub(crate) store: RedisStore,
    pub(crate) registry: Arc<CacheRegistry>,
    pub(crate) pool: Arc<RefreshPool>,
    pub(crate) publisher: InvalidationPublisher,
    pub(crate) listener: InvalidationListener,
    pub(crate) listener_task: JoinHandle<()>,
    pub(crate) aggregator: StatsAggregator,
    pub(crate) stats_task: Option<JoinHandle<()>>,
}

impl CacheSystem {
    /// Build with defaults; the Redis URL comes from the `REDIS_URL`
    /// environment variable, falling back to `redis://127.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Connection failures against the Redis server.
    pub async fn new() -> CacheResult<Self> {
        CacheSystemBuilder::new().build().await
    }

    /// Build with an explicit Redis URL.
    ///
    /// # Errors
    ///
    /// Connection failures against the Redis server.
    pub async fn with_redis_url(redis_url: &str) -> CacheResult<Self> {
        CacheSystemBuilder::new().redis_url(redis_url).build().await
    }

    /// A fresh builder for custom configuration.
    #[must_use]
    pub fn builder() -> CacheSystemBuilder {
        CacheSystemBuilder::new()
    }

    /// Fetch or lazily create the cache for `(name, settings)`.
    #[must_use]
    pub fn cache(&self, name: &str, settings: &TierSettings) -> Cache {
        self.registry.get_or_create(name, settings)
    }

    /// The cache registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// The stats aggregator (durable record reads, manual sync).
    #[must_use]
    pub fn stats(&self) -> &StatsAggregator {
        &self.aggregator
    }

    /// Liveness probe against the shared store.
    pub async fn ping(&self) -> bool {
        self.store.ping().await
    }

    /// Evict `key` from every settings variant of `name`, fleet-wide.
    /// Unknown names get a default-settings cache synthesized, so the call
    /// never fails for lack of a registration.
    ///
    /// # Errors
    ///
    /// Store or publish failures.
    pub async fn evict(&self, name: &str, key: &str) -> CacheResult<()> {
        for cache in self.registry.get_all(name) {
            cache.evict(key).await?;
        }
        Ok(())
    }

    /// Clear every settings variant of `name`, fleet-wide, and zero the
    /// matching durable stats records.
    ///
    /// # Errors
    ///
    /// Store or publish failures.
    pub async fn clear(&self, name: &str) -> CacheResult<()> {
        for cache in self.registry.get_all(name) {
            cache.clear().await?;
            if let Some(tiered) = cache.as_tiered() {
                let record_key =
                    stats::record_key(tiered.name(), &tiered.settings().internal_key());
                self.aggregator.reset_record(&record_key).await?;
            }
        }
        Ok(())
    }

    /// Publish an invalidation without going through a cache instance, e.g.
    /// for operational tooling. With [`OUT_OF_BAND_SOURCE`] set, listeners
    /// drop the remote entry too.
    ///
    /// # Errors
    ///
    /// Store or publish failures.
    pub async fn publish_invalidation(&self, message: &InvalidationMessage) -> CacheResult<()> {
        self.publisher.publish(message).await
    }

    /// Stop the background machinery: refresh workers, the stats
    /// aggregator, and the invalidation listener.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.aggregator.shutdown();
        self.listener.shutdown();
        if let Some(task) = &self.stats_task {
            task.abort();
        }
        self.listener_task.abort();
    }
}
