//! Counters, the durable stats record, and the cross-process aggregator.
//!
//! Every tier keeps lock-free additive [`CacheCounters`]. A dedicated task
//! periodically folds them into a durable [`CacheStatsRecord`] per
//! `(cache name, internal key)`, merging under a per-record distributed
//! mutex so concurrent processes never lose each other's updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::lock::DistributedMutex;
use crate::registry::CacheRegistry;
use crate::settings::TierSettings;
use crate::store::RedisStore;
use crate::tiered::{Cache, TieredCache};

/// Key prefix for durable per-cache statistics records.
pub const STATS_PREFIX: &str = "strata:stats:";

/// TTL on the durable record.
const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Fixed delay between aggregation cycles.
const SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Lease on the per-record merge lock.
const MERGE_LOCK_LEASE: Duration = Duration::from_secs(60);
/// Budget for acquiring the merge lock before the cycle is skipped.
const MERGE_LOCK_BUDGET: Duration = Duration::from_secs(5);

/// Redis key of the durable record for `(name, internal key)`.
#[must_use]
pub fn record_key(cache_name: &str, internal_key: &str) -> String {
    format!("{STATS_PREFIX}{cache_name}{internal_key}")
}

/// Lock-free additive counters. Cloning yields another handle onto the same
/// cells, so tiers and background tasks can share them freely.
#[derive(Clone, Debug, Default)]
pub struct CacheCounters {
    inner: Arc<CounterCells>,
}

#[derive(Debug, Default)]
struct CounterCells {
    request_count: AtomicU64,
    cached_request_count: AtomicU64,
    cached_request_time: AtomicU64,
}

impl CacheCounters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `n` cache requests.
    pub fn add_request_count(&self, n: u64) {
        self.inner.request_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Count `n` loader invocations.
    pub fn add_cached_request_count(&self, n: u64) {
        self.inner.cached_request_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `ms` milliseconds of loader wall time.
    pub fn add_cached_request_time(&self, ms: u64) {
        self.inner.cached_request_time.fetch_add(ms, Ordering::Relaxed);
    }

    /// Requests observed so far.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    /// Loader invocations observed so far.
    #[must_use]
    pub fn cached_request_count(&self) -> u64 {
        self.inner.cached_request_count.load(Ordering::Relaxed)
    }

    /// Loader wall time observed so far, milliseconds.
    #[must_use]
    pub fn cached_request_time(&self) -> u64 {
        self.inner.cached_request_time.load(Ordering::Relaxed)
    }

    /// Read and reset the request count.
    pub fn take_request_count(&self) -> u64 {
        self.inner.request_count.swap(0, Ordering::Relaxed)
    }

    /// Read and reset the loader invocation count.
    pub fn take_cached_request_count(&self) -> u64 {
        self.inner.cached_request_count.swap(0, Ordering::Relaxed)
    }

    /// Read and reset the loader wall time.
    pub fn take_cached_request_time(&self) -> u64 {
        self.inner.cached_request_time.swap(0, Ordering::Relaxed)
    }
}

/// Point-in-time view of a cache's counters, returned by `stats()`.
/// Reading a snapshot does not reset anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    /// Requests against the cache surface.
    pub request_count: u64,
    /// Loader invocations (requests the cache could not answer).
    pub cached_request_count: u64,
    /// Total loader wall time, milliseconds.
    pub cached_request_time_ms: u64,
    /// Requests that reached the local tier.
    pub local_request_count: u64,
    /// Requests that reached the remote tier.
    pub remote_request_count: u64,
    /// Percentage of requests answered without running the loader.
    pub hit_rate: f64,
}

impl StatsSnapshot {
    pub(crate) fn from_local(counters: &CacheCounters) -> Self {
        let requests = counters.request_count();
        let loads = counters.cached_request_count();
        Self {
            request_count: requests,
            cached_request_count: loads,
            cached_request_time_ms: counters.cached_request_time(),
            local_request_count: requests,
            remote_request_count: 0,
            hit_rate: hit_rate(requests, loads),
        }
    }

    pub(crate) fn from_remote(counters: &CacheCounters) -> Self {
        let requests = counters.request_count();
        let loads = counters.cached_request_count();
        Self {
            request_count: requests,
            cached_request_count: loads,
            cached_request_time_ms: counters.cached_request_time(),
            local_request_count: 0,
            remote_request_count: requests,
            hit_rate: hit_rate(requests, loads),
        }
    }

    pub(crate) fn from_tiers(local: &CacheCounters, remote: &CacheCounters) -> Self {
        // Every request touches the local tier first, so its request count
        // is the cache-level request count; the loader only ever runs in the
        // remote tier.
        let requests = local.request_count();
        let loads = remote.cached_request_count();
        Self {
            request_count: requests,
            cached_request_count: loads,
            cached_request_time_ms: remote.cached_request_time(),
            local_request_count: requests,
            remote_request_count: remote.request_count(),
            hit_rate: hit_rate(requests, loads),
        }
    }
}

fn hit_rate(requests: u64, misses: u64) -> f64 {
    if requests == 0 {
        return 0.0;
    }
    let hits = requests.saturating_sub(misses);
    #[allow(clippy::cast_precision_loss)]
    let rate = hits as f64 / requests as f64 * 100.0;
    rate
}

/// Durable aggregate merged across processes; one record per
/// `(cache name, internal key)`, kept for 24 hours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsRecord {
    /// Cache name.
    pub cache_name: String,
    /// Settings-derived identity suffix.
    pub internal_key: String,
    /// Free-text description from the cache settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Requests across all processes.
    pub request_count: u64,
    /// Requests that ran the loader.
    pub miss_count: u64,
    /// Percentage of requests answered from cache.
    pub hit_rate: f64,
    /// Requests that reached the local tier.
    pub l1_request_count: u64,
    /// Local-tier misses (fall-throughs to the remote tier).
    pub l1_miss_count: u64,
    /// Requests that reached the remote tier.
    pub l2_request_count: u64,
    /// Remote-tier misses (loader invocations).
    pub l2_miss_count: u64,
    /// Total loader wall time, milliseconds.
    pub total_load_time: u64,
    /// Snapshot of the settings the cache was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_snapshot: Option<TierSettings>,
}

impl CacheStatsRecord {
    /// Zero the aggregated counters in place, keeping identity and settings.
    pub fn reset(&mut self) {
        self.request_count = 0;
        self.miss_count = 0;
        self.hit_rate = 0.0;
        self.l1_request_count = 0;
        self.l1_miss_count = 0;
        self.l2_request_count = 0;
        self.l2_miss_count = 0;
        self.total_load_time = 0;
    }
}

/// Periodic cross-process counter merge.
///
/// One dedicated task per process; each cycle walks every registered tiered
/// cache, takes its counters (read-and-reset), and folds them into the
/// durable record under that record's own distributed mutex.
pub struct StatsAggregator {
    store: RedisStore,
    registry: Arc<CacheRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StatsAggregator {
    pub(crate) fn new(store: RedisStore, registry: Arc<CacheRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            registry,
            shutdown_tx,
        }
    }

    /// Start the fixed-delay aggregation task.
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(SYNC_INTERVAL) => sync_all(&store, &registry).await,
                    _ = shutdown_rx.recv() => {
                        info!("stats aggregator shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the aggregation task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run one merge cycle immediately, outside the schedule.
    pub async fn sync_now(&self) {
        sync_all(&self.store, &self.registry).await;
    }

    /// Every durable record, optionally filtered by cache name, sorted
    /// ascending by hit rate.
    ///
    /// # Errors
    ///
    /// Propagates store failures; undecodable records are skipped with a
    /// warning.
    pub async fn list_records(&self, cache_name: Option<&str>) -> CacheResult<Vec<CacheStatsRecord>> {
        let keys = self.store.scan(&format!("{STATS_PREFIX}*")).await?;
        let mut records = Vec::new();

        for key in keys {
            if let Some(name) = cache_name {
                if !key.starts_with(&format!("{STATS_PREFIX}{name}")) {
                    continue;
                }
            }
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<CacheStatsRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "undecodable stats record, skipping"),
            }
        }

        records.sort_by(|a, b| {
            a.hit_rate
                .partial_cmp(&b.hit_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(records)
    }

    /// Zero every durable record in place. Records that no longer decode are
    /// deleted.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset_records(&self) -> CacheResult<()> {
        for key in self.store.scan(&format!("{STATS_PREFIX}*")).await? {
            self.reset_record(&key).await?;
        }
        Ok(())
    }

    /// Zero one durable record by its full Redis key.
    pub(crate) async fn reset_record(&self, key: &str) -> CacheResult<()> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(());
        };
        match serde_json::from_slice::<CacheStatsRecord>(&bytes) {
            Ok(mut record) => {
                record.reset();
                let payload = encode_record(&record, key)?;
                self.store.set_ex(key, &payload, RECORD_TTL).await?;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "deleting undecodable stats record");
                self.store.del(key).await?;
            }
        }
        Ok(())
    }
}

async fn sync_all(store: &RedisStore, registry: &Arc<CacheRegistry>) {
    debug!("stats aggregation cycle");
    for cache in registry.all() {
        let Cache::Tiered(tiered) = &cache else {
            // Only tiered caches carry a durable record; single-tier caches
            // have no settings-derived identity to merge under.
            continue;
        };
        if let Err(e) = sync_one(store, tiered).await {
            error!(cache = %tiered.name(), error = %e, "stats merge failed");
        }
    }
}

async fn sync_one(store: &RedisStore, tiered: &TieredCache) -> CacheResult<()> {
    let key = record_key(tiered.name(), &tiered.settings().internal_key());
    let mut lock = DistributedMutex::new(store, &key, MERGE_LOCK_LEASE);

    if !lock.acquire_with_timeout(MERGE_LOCK_BUDGET).await? {
        debug!(key = %key, "merge lock contended, skipping cycle");
        return Ok(());
    }

    let merged = merge_record(store, tiered, &key).await;
    if let Err(e) = lock.release().await {
        debug!(key = %key, error = %e, "merge lock release failed");
    }
    merged
}

async fn merge_record(store: &RedisStore, tiered: &TieredCache, key: &str) -> CacheResult<()> {
    let mut record = match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        None => CacheStatsRecord::default(),
    };

    let settings = tiered.settings();
    record.cache_name = tiered.name().to_owned();
    record.internal_key = settings.internal_key();
    record.description = settings.description.clone();
    record.settings_snapshot = Some(settings.clone());

    let l1_requests = tiered.local_tier().counters().take_request_count();
    let remote = tiered.remote_tier().counters();
    let l2_requests = remote.take_request_count();
    let loads = remote.take_cached_request_count();
    let load_time = remote.take_cached_request_time();

    record.request_count += l1_requests;
    record.miss_count += loads;
    record.l1_request_count += l1_requests;
    // A local miss is exactly a fall-through to the remote tier.
    record.l1_miss_count += l2_requests;
    record.l2_request_count += l2_requests;
    record.l2_miss_count += loads;
    record.total_load_time += load_time;
    record.hit_rate = hit_rate(record.request_count, record.miss_count);

    let payload = encode_record(&record, key)?;
    store.set_ex(key, &payload, RECORD_TTL).await?;

    info!(
        cache = %record.cache_name,
        requests = record.request_count,
        hit_rate = record.hit_rate,
        "stats record merged"
    );
    Ok(())
}

fn encode_record(record: &CacheStatsRecord, key: &str) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| CacheError::Serialization {
        key: key.to_owned(),
        codec: "serde_json",
        source: e.into(),
    })
}
