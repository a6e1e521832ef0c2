//! Tiering behavior against a live Redis: write ordering, backfill, null
//! caching, and idempotent eviction.

mod common;

use common::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test]
async fn put_reaches_remote_first_and_local_only_on_read() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("put");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let tiered = cache.as_tiered().unwrap();

    tiered.put("k", &json!("v1")).await.unwrap();
    // Let the self-delivered EVICT broadcast land before probing the tiers.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Remote holds the value immediately; local stays empty until a read
    // backfills it.
    assert_eq!(tiered.remote_tier().get("k").await.unwrap(), Some(json!("v1")));
    assert_eq!(tiered.local_tier().get("k").await, None);

    assert_eq!(tiered.get("k").await.unwrap(), Some(json!("v1")));
    assert_eq!(tiered.local_tier().get("k").await, Some(json!("v1")));

    tiered.clear().await.unwrap();
    system.shutdown();
}

#[tokio::test]
async fn get_or_load_counts_requests_and_loader_runs() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("counters");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let tiered = cache.as_tiered().unwrap().clone();
    let loads = Arc::new(AtomicU32::new(0));

    let loader = {
        let loads = Arc::clone(&loads);
        move || {
            let loads = Arc::clone(&loads);
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(json!("value"))
            }
        }
    };

    // Miss then hit.
    tiered.get_or_load("k", loader.clone()).await.unwrap();
    tiered.get_or_load("k", loader.clone()).await.unwrap();

    // Force a second genuine miss by dropping both tiers directly.
    tiered.remote_tier().evict("k").await.unwrap();
    tiered.local_tier().evict("k").await;

    // Miss then hit again.
    tiered.get_or_load("k", loader.clone()).await.unwrap();
    tiered.get_or_load("k", loader).await.unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 2);
    let stats = tiered.stats();
    assert_eq!(stats.request_count, 4);
    assert_eq!(stats.cached_request_count, 2);
    assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);

    tiered.clear().await.unwrap();
    system.shutdown();
}

#[tokio::test]
async fn null_results_are_cached_distinct_from_absence() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("null");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let tiered = cache.as_tiered().unwrap();
    let loads = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let loads = Arc::clone(&loads);
        let value = tiered
            .get_or_load("missing-user", move || {
                let loads = Arc::clone(&loads);
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    // One loader run produced a durable null marker, not repeated misses.
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        tiered.remote_tier().get("missing-user").await.unwrap(),
        Some(Value::Null)
    );
    assert_eq!(tiered.remote_tier().get("never-seen").await.unwrap(), None);

    tiered.clear().await.unwrap();
    system.shutdown();
}

#[tokio::test]
async fn evict_and_clear_are_idempotent() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("idem");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));

    cache.put("a", &json!(1)).await.unwrap();
    cache.put("b", &json!(2)).await.unwrap();

    cache.evict("a").await.unwrap();
    cache.evict("a").await.unwrap();
    cache.evict("never-existed").await.unwrap();
    assert_eq!(cache.get("a").await.unwrap(), None);

    cache.clear().await.unwrap();
    cache.clear().await.unwrap();
    assert_eq!(cache.get("b").await.unwrap(), None);

    system.shutdown();
}

#[tokio::test]
async fn put_if_absent_keeps_the_resident_value() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("pia");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));

    assert_eq!(cache.put_if_absent("k", &json!("first")).await.unwrap(), None);
    assert_eq!(
        cache.put_if_absent("k", &json!("second")).await.unwrap(),
        Some(json!("first"))
    );
    assert_eq!(cache.get("k").await.unwrap(), Some(json!("first")));

    cache.clear().await.unwrap();
    system.shutdown();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

#[tokio::test]
async fn typed_read_through_round_trips() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("typed");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let tiered = cache.as_tiered().unwrap();

    let expected = User {
        id: 7,
        name: "alice".to_owned(),
    };

    let loaded: User = tiered
        .get_or_load_typed("u:7", {
            let expected = expected.clone();
            move || {
                let expected = expected.clone();
                async move { Ok(expected) }
            }
        })
        .await
        .unwrap();
    assert_eq!(loaded, expected);

    // Second read deserializes the cached form without a loader.
    let cached: User = tiered
        .get_or_load_typed("u:7", || async { anyhow::bail!("loader must not run") })
        .await
        .unwrap();
    assert_eq!(cached, expected);

    tiered.clear().await.unwrap();
    system.shutdown();
}

#[tokio::test]
async fn registry_deduplicates_by_settings_identity() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("registry");

    let settings = tiered_settings(60, 120, 5);
    let first = system.cache(&name, &settings);
    let second = system.cache(&name, &settings);
    // Same identity: the same instance comes back.
    assert!(Arc::ptr_eq(
        first.as_tiered().unwrap(),
        second.as_tiered().unwrap()
    ));

    // A different expiry tuple registers a second variant under the name.
    let variant = system.cache(&name, &tiered_settings(30, 120, 5));
    assert!(!Arc::ptr_eq(
        first.as_tiered().unwrap(),
        variant.as_tiered().unwrap()
    ));
    assert_eq!(system.registry().get_all(&name).len(), 2);

    // Unknown names synthesize a default-settings instance on demand.
    let unknown = test_cache_name("unknown");
    assert_eq!(system.registry().get_all(&unknown).len(), 1);

    system.shutdown();
}
