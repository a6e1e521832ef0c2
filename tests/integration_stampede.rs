//! Fleet-wide single-flight loading under concurrency.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn concurrent_misses_run_the_loader_once() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("stampede");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let loads = Arc::new(AtomicU32::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let cache = cache.clone();
        let loads = Arc::clone(&loads);
        tasks.spawn(async move {
            cache
                .get_or_load("hot", move || {
                    let loads = Arc::clone(&loads);
                    async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        // Slow enough that every other caller arrives while
                        // the load is still in flight.
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok(json!({"answer": 42}))
                    }
                })
                .await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let value = joined.unwrap().unwrap();
        assert_eq!(value, json!({"answer": 42}));
    }
    assert_eq!(
        loads.load(Ordering::SeqCst),
        1,
        "every concurrent caller must observe the single load"
    );

    cache.clear().await.unwrap();
    system.shutdown();
}

#[tokio::test]
async fn two_instances_share_one_load() {
    if skip_without_redis().await {
        return;
    }
    let system_a = build_system().await;
    let system_b = build_system().await;
    let name = test_cache_name("fleet");
    let settings = tiered_settings(60, 120, 5);
    let cache_a = system_a.cache(&name, &settings);
    let cache_b = system_b.cache(&name, &settings);
    let loads = Arc::new(AtomicU32::new(0));

    let loader = |loads: Arc<AtomicU32>| {
        move || {
            let loads = Arc::clone(&loads);
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(json!("shared"))
            }
        }
    };

    let a = tokio::spawn({
        let cache = cache_a.clone();
        let loader = loader(Arc::clone(&loads));
        async move { cache.get_or_load("k", loader).await }
    });
    let b = tokio::spawn({
        let cache = cache_b.clone();
        let loader = loader(Arc::clone(&loads));
        async move { cache.get_or_load("k", loader).await }
    });

    assert_eq!(a.await.unwrap().unwrap(), json!("shared"));
    assert_eq!(b.await.unwrap().unwrap(), json!("shared"));
    assert_eq!(
        loads.load(Ordering::SeqCst),
        1,
        "the load lock must coalesce loads across instances"
    );

    cache_a.clear().await.unwrap();
    system_a.shutdown();
    system_b.shutdown();
}

#[tokio::test]
async fn loader_failure_wakes_waiters_who_retry() {
    if skip_without_redis().await {
        return;
    }
    let system = build_system().await;
    let name = test_cache_name("failure");
    let cache = system.cache(&name, &tiered_settings(60, 120, 5));
    let attempts = Arc::new(AtomicU32::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let attempts = Arc::clone(&attempts);
        tasks.spawn(async move {
            cache
                .get_or_load("flaky", move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        // The first attempt fails; a woken waiter's retry
                        // succeeds.
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("upstream unavailable");
                        }
                        Ok(json!("recovered"))
                    }
                })
                .await
        });
    }

    let mut failures = 0;
    let mut successes = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(value) => {
                assert_eq!(value, json!("recovered"));
                successes += 1;
            }
            Err(strata_cache::CacheError::Loader { key, .. }) => {
                assert!(key.ends_with("flaky"));
                failures += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(failures, 1, "only the failing loader's caller sees the error");
    assert_eq!(successes, 4, "woken waiters retry and succeed");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    cache.clear().await.unwrap();
    system.shutdown();
}
