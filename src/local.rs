//! In-process tier backed by Moka.
//!
//! Bounded by entry count and a uniform write-time TTL. This tier never
//! enforces fleet consistency on its own: it changes only through explicit
//! local mutation or an invalidation delivered by the orchestrator. A cached
//! logical null is a resident `Value::Null` entry, distinct from absence.

use std::future::Future;
use std::time::Instant;

use moka::future::Cache as MokaCache;
use serde_json::Value;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::settings::LocalSettings;
use crate::stats::CacheCounters;

/// Bounded, TTL-evicting per-process cache tier.
pub struct LocalTier {
    name: String,
    cache: MokaCache<String, Value>,
    counters: CacheCounters,
}

impl LocalTier {
    /// Build a tier from its settings.
    #[must_use]
    pub fn new(name: impl Into<String>, settings: &LocalSettings) -> Self {
        let cache = MokaCache::builder()
            .initial_capacity(settings.initial_capacity)
            .max_capacity(settings.max_entries)
            .time_to_live(settings.ttl())
            .build();

        Self {
            name: name.into(),
            cache,
            counters: CacheCounters::new(),
        }
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up `key`. `None` means absent (or expired), `Some(Value::Null)`
    /// a cached logical null.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.counters.add_request_count(1);
        self.cache.get(key).await
    }

    /// Look up `key`, invoking `loader` synchronously on a miss and caching
    /// its result before returning — a logical-null outcome included.
    ///
    /// # Errors
    ///
    /// [`CacheError::Loader`] when the loader fails; nothing is cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let started = Instant::now();
        self.counters.add_cached_request_count(1);
        let value = loader().await.map_err(|e| CacheError::Loader {
            key: key.to_owned(),
            source: e,
        })?;
        let cost = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.counters.add_cached_request_time(cost);

        debug!(cache = %self.name, key = %key, cost_ms = cost, "local loader executed");
        self.cache.insert(key.to_owned(), value.clone()).await;
        Ok(value)
    }

    /// Store `value` under `key`.
    pub async fn put(&self, key: &str, value: Value) {
        self.cache.insert(key.to_owned(), value).await;
    }

    /// Store `value` only when `key` is absent, so a racing writer's fresher
    /// entry is not disturbed. Returns the previously resident value, if any.
    pub async fn put_if_absent(&self, key: &str, value: Value) -> Option<Value> {
        let entry = self.cache.entry(key.to_owned()).or_insert(value).await;
        if entry.is_fresh() {
            None
        } else {
            Some(entry.into_value())
        }
    }

    /// Drop `key`. Repeat calls are no-ops.
    pub async fn evict(&self, key: &str) {
        debug!(cache = %self.name, key = %key, "local evict");
        self.cache.invalidate(key).await;
    }

    /// Drop every entry.
    pub fn clear(&self) {
        debug!(cache = %self.name, "local clear");
        self.cache.invalidate_all();
    }

    /// This tier's counters.
    #[must_use]
    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tier() -> LocalTier {
        LocalTier::new("test", &LocalSettings::default())
    }

    #[tokio::test]
    async fn put_then_get() {
        let tier = tier();
        tier.put("a", json!(1)).await;
        assert_eq!(tier.get("a").await, Some(json!(1)));
        assert_eq!(tier.get("missing").await, None);
    }

    #[tokio::test]
    async fn cached_null_is_distinct_from_absent() {
        let tier = tier();
        tier.put("nothing", Value::Null).await;
        assert_eq!(tier.get("nothing").await, Some(Value::Null));
        assert_eq!(tier.get("absent").await, None);
    }

    #[tokio::test]
    async fn loader_runs_once_then_hits() {
        let tier = tier();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value = tier
                .get_or_load("k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!("loaded")) }
                })
                .await
                .unwrap();
            assert_eq!(value, json!("loaded"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tier.counters().request_count(), 3);
        assert_eq!(tier.counters().cached_request_count(), 1);
    }

    #[tokio::test]
    async fn null_loader_result_is_cached() {
        let tier = tier();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let value = tier
                .get_or_load("gone", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                })
                .await
                .unwrap();
            assert_eq!(value, Value::Null);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "null result should be cached");
    }

    #[tokio::test]
    async fn loader_failure_caches_nothing() {
        let tier = tier();
        let err = tier
            .get_or_load("bad", || async { anyhow::bail!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Loader { .. }));
        assert_eq!(tier.get("bad").await, None);
    }

    #[tokio::test]
    async fn put_if_absent_keeps_existing() {
        let tier = tier();
        assert_eq!(tier.put_if_absent("k", json!("first")).await, None);
        assert_eq!(
            tier.put_if_absent("k", json!("second")).await,
            Some(json!("first"))
        );
        assert_eq!(tier.get("k").await, Some(json!("first")));
    }

    #[tokio::test]
    async fn evict_and_clear_are_idempotent() {
        let tier = tier();
        tier.put("a", json!(1)).await;
        tier.evict("a").await;
        tier.evict("a").await;
        assert_eq!(tier.get("a").await, None);

        tier.put("b", json!(2)).await;
        tier.clear();
        tier.clear();
        assert_eq!(tier.get("b").await, None);
    }
}
