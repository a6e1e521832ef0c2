//! Named, lazily-created, deduplicated cache instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::codecs::Codec;
use crate::invalidation::InvalidationPublisher;
use crate::local::LocalTier;
use crate::pool::RefreshPool;
use crate::remote::RemoteTier;
use crate::settings::{TierMode, TierSettings};
use crate::store::RedisStore;
use crate::tiered::{Cache, TieredCache};

/// Process-wide cache registry: one instance per `(name, internal key)`.
///
/// Constructed once at startup and passed by reference to the invalidation
/// listener and the stats aggregator; there is no process-global state.
pub struct CacheRegistry {
    store: RedisStore,
    codec: Arc<dyn Codec>,
    pool: Arc<RefreshPool>,
    publisher: InvalidationPublisher,
    /// Outer key: cache name. Inner key: settings-derived internal key.
    caches: RwLock<HashMap<String, HashMap<String, Cache>>>,
}

impl CacheRegistry {
    pub(crate) fn new(
        store: RedisStore,
        codec: Arc<dyn Codec>,
        pool: Arc<RefreshPool>,
        publisher: InvalidationPublisher,
    ) -> Self {
        Self {
            store,
            codec,
            pool,
            publisher,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the cache for `(name, settings)`, creating it on first use.
    /// Double-checked: an uncontended read probe first, then the write lock
    /// with a re-check before construction.
    pub fn get_or_create(&self, name: &str, settings: &TierSettings) -> Cache {
        let internal_key = settings.internal_key();

        {
            let caches = self.caches.read();
            if let Some(by_key) = caches.get(name) {
                if let Some(cache) = by_key.get(&internal_key) {
                    return cache.clone();
                }
            }
        }

        let mut caches = self.caches.write();
        let by_key = caches.entry(name.to_owned()).or_default();
        if let Some(cache) = by_key.get(&internal_key) {
            return cache.clone();
        }

        let cache = self.build(name, settings);
        by_key.insert(internal_key, cache.clone());
        if by_key.len() > 1 {
            warn!(
                cache = %name,
                variants = by_key.len(),
                "cache name registered with multiple expiry configurations; keys shared across them will see whichever TTL wrote last"
            );
        }
        cache
    }

    /// Every settings variant registered under `name`. Unknown names get a
    /// default-settings instance synthesized on the spot, so evict/clear by
    /// name alone always has a target.
    pub fn get_all(&self, name: &str) -> Vec<Cache> {
        {
            let caches = self.caches.read();
            if let Some(by_key) = caches.get(name) {
                if !by_key.is_empty() {
                    return by_key.values().cloned().collect();
                }
            }
        }
        vec![self.get_or_create(name, &TierSettings::default())]
    }

    /// Registered cache names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Every registered cache across all names.
    #[must_use]
    pub fn all(&self) -> Vec<Cache> {
        self.caches
            .read()
            .values()
            .flat_map(|by_key| by_key.values().cloned())
            .collect()
    }

    fn build(&self, name: &str, settings: &TierSettings) -> Cache {
        match settings.mode {
            TierMode::LocalOnly => Cache::LocalOnly(Arc::new(LocalTier::new(name, &settings.local))),
            TierMode::RemoteOnly => Cache::RemoteOnly(Arc::new(self.build_remote(name, settings))),
            TierMode::Tiered => {
                let local = Arc::new(LocalTier::new(name, &settings.local));
                let remote = Arc::new(self.build_remote(name, settings));
                Cache::Tiered(Arc::new(TieredCache::new(
                    name,
                    settings.clone(),
                    local,
                    remote,
                    self.publisher.clone(),
                )))
            }
        }
    }

    fn build_remote(&self, name: &str, settings: &TierSettings) -> RemoteTier {
        RemoteTier::new(
            name,
            settings.remote,
            self.store.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.pool),
        )
    }
}
