//! Shared infrastructure for the Redis-backed integration tests.
//!
//! Every test probes the server first and skips (with a note on stderr)
//! when none is reachable, so the suite stays green on machines without a
//! local Redis.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::time::Duration;

use strata_cache::{CacheSystem, CacheSystemBuilder, TierMode, TierSettings};

/// Redis URL from the environment or the local default.
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// `true` when no Redis server answers within a second; callers return
/// early in that case.
pub async fn skip_without_redis() -> bool {
    let reachable = async {
        let client = redis::Client::open(redis_url().as_str()).ok()?;
        let mut conn = tokio::time::timeout(
            Duration::from_secs(1),
            client.get_multiplexed_async_connection(),
        )
        .await
        .ok()?
        .ok()?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .ok()
    };
    if reachable.await.is_none() {
        eprintln!("skipping: no Redis server at {}", redis_url());
        return true;
    }
    false
}

/// Unique cache name so concurrent test runs never share keys.
pub fn test_cache_name(prefix: &str) -> String {
    format!("it_{}_{:08x}", prefix, rand::random::<u32>())
}

/// A system with the periodic stats task off; tests drive syncs explicitly.
pub async fn build_system() -> CacheSystem {
    CacheSystemBuilder::new()
        .redis_url(redis_url())
        .stats(false)
        .build()
        .await
        .unwrap_or_else(|e| panic!("failed to build cache system: {e}"))
}

/// Tiered settings with short, test-friendly expiry times.
pub fn tiered_settings(local_ttl_secs: u64, remote_ttl_secs: u64, preload_secs: u64) -> TierSettings {
    let mut settings = TierSettings::default();
    settings.local.ttl_secs = local_ttl_secs;
    settings.remote.ttl_secs = remote_ttl_secs;
    settings.remote.preload_secs = preload_secs;
    settings
}

/// Remote-only settings, used where the local tier would mask remote reads.
pub fn remote_only_settings(remote_ttl_secs: u64, preload_secs: u64, force_refresh: bool) -> TierSettings {
    let mut settings = tiered_settings(1, remote_ttl_secs, preload_secs);
    settings.mode = TierMode::RemoteOnly;
    settings.remote.force_refresh = force_refresh;
    settings
}

/// Poll an async condition until it holds or `timeout_ms` elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    while started.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
