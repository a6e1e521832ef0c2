//! Cache system builder.
//!
//! # Example
//!
//! ```rust,no_run
//! use strata_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> strata_cache::CacheResult<()> {
//!     let system = CacheSystemBuilder::new()
//!         .redis_url("redis://localhost:6379")
//!         .stats(true)
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::CacheSystem;
use crate::codecs::{Codec, JsonCodec};
use crate::error::CacheResult;
use crate::invalidation::{INVALIDATION_CHANNEL, InvalidationListener, InvalidationPublisher};
use crate::pool::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, RefreshPool};
use crate::registry::CacheRegistry;
use crate::stats::StatsAggregator;
use crate::store::{DEFAULT_SCAN_PAGE_SIZE, RedisStore};

/// Builder for [`CacheSystem`].
///
/// Defaults: Redis URL from the `REDIS_URL` environment variable (falling
/// back to `redis://127.0.0.1:6379`), JSON codec, the fixed invalidation
/// channel, stats aggregation on.
pub struct CacheSystemBuilder {
    redis_url: Option<String>,
    channel: String,
    codec: Arc<dyn Codec>,
    stats: bool,
    scan_page_size: usize,
    refresh_workers: usize,
    refresh_queue_capacity: usize,
}

impl CacheSystemBuilder {
    /// Builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            redis_url: None,
            channel: INVALIDATION_CHANNEL.to_owned(),
            codec: Arc::new(JsonCodec),
            stats: true,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            refresh_workers: DEFAULT_WORKERS,
            refresh_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Redis connection URL.
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Invalidation channel name. All instances of a fleet must agree on it.
    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Value codec for the remote tier.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Enable or disable the periodic stats aggregation task.
    #[must_use]
    pub fn stats(mut self, enabled: bool) -> Self {
        self.stats = enabled;
        self
    }

    /// Page size for cursor-based SCAN (clear, stats listing).
    #[must_use]
    pub fn scan_page_size(mut self, page_size: usize) -> Self {
        self.scan_page_size = page_size;
        self
    }

    /// Size the hard-refresh worker pool.
    #[must_use]
    pub fn refresh_pool(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.refresh_workers = workers;
        self.refresh_queue_capacity = queue_capacity;
        self
    }

    /// Connect to the store, wire the registry, and start the background
    /// tasks (invalidation listener, and the stats aggregator when enabled).
    ///
    /// # Errors
    ///
    /// Connection failures against the Redis server.
    pub async fn build(self) -> CacheResult<CacheSystem> {
        let redis_url = self.redis_url.unwrap_or_else(|| {
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned())
        });

        let store = RedisStore::connect(&redis_url, self.scan_page_size).await?;
        let pool = Arc::new(RefreshPool::new(
            self.refresh_workers,
            self.refresh_queue_capacity,
        ));
        let publisher = InvalidationPublisher::new(store.clone(), self.channel.clone());
        let registry = Arc::new(CacheRegistry::new(
            store.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&pool),
            publisher.clone(),
        ));

        let listener =
            InvalidationListener::new(store.clone(), Arc::clone(&registry), self.channel);
        let listener_task = listener.start();

        let aggregator = StatsAggregator::new(store.clone(), Arc::clone(&registry));
        let stats_task = self.stats.then(|| aggregator.start());

        info!(codec = self.codec.name(), stats = self.stats, "cache system initialized");

        Ok(CacheSystem {
            store,
            registry,
            pool,
            publisher,
            listener,
            listener_task,
            aggregator,
            stats_task,
        })
    }
}

impl Default for CacheSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
