//! Best-effort distributed lease lock over the shared store.
//!
//! Acquire is `SET key token NX EX lease`; release is an atomic
//! compare-and-delete so a lease that already expired and was re-acquired
//! by another holder is never deleted by us. The lease TTL means a crashed
//! holder's lock heals on its own. Not linearizable.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::error::CacheResult;
use crate::store::RedisStore;

/// Lock keys live in their own namespace, out of the cached-data keyspace.
const LOCK_PREFIX: &str = "lock:";

/// Base pause between acquisition attempts in `acquire_with_timeout`.
const RETRY_PAUSE: Duration = Duration::from_millis(10);
/// Upper bound on the random jitter added to each pause, in milliseconds.
const RETRY_JITTER_MS: u64 = 5;

/// A single lease attempt on one lock key, carrying its own random token.
pub struct DistributedMutex {
    store: RedisStore,
    key: String,
    token: String,
    lease: Duration,
    held: bool,
}

impl DistributedMutex {
    /// New unheld mutex for `key` with the given lease TTL.
    #[must_use]
    pub fn new(store: &RedisStore, key: &str, lease: Duration) -> Self {
        Self {
            store: store.clone(),
            key: format!("{LOCK_PREFIX}{key}"),
            token: Uuid::new_v4().to_string(),
            lease,
            held: false,
        }
    }

    /// Single acquisition attempt, immediate result.
    pub async fn try_acquire(&mut self) -> CacheResult<bool> {
        self.held = self
            .store
            .set_nx_ex(&self.key, self.token.as_bytes(), self.lease)
            .await?;
        if self.held {
            debug!(key = %self.key, "lock acquired");
        }
        Ok(self.held)
    }

    /// Repeated attempts with jittered pauses until acquired or `budget`
    /// elapses. `false` on timeout — callers treat that as a skipped cycle,
    /// not a failure.
    pub async fn acquire_with_timeout(&mut self, budget: Duration) -> CacheResult<bool> {
        let started = Instant::now();
        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }
            if started.elapsed() >= budget {
                debug!(key = %self.key, budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX), "lock not acquired within budget");
                return Ok(false);
            }
            let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
            tokio::time::sleep(RETRY_PAUSE + Duration::from_millis(jitter)).await;
        }
    }

    /// Release the lease if this mutex still holds it. Returns `false` when
    /// the lease had already expired and someone else owns the key now.
    pub async fn release(&mut self) -> CacheResult<bool> {
        if !self.held {
            return Ok(true);
        }
        self.held = false;
        let deleted = self.store.compare_and_delete(&self.key, &self.token).await?;
        if deleted {
            debug!(key = %self.key, "lock released");
        } else {
            debug!(key = %self.key, "lease expired before release");
        }
        Ok(deleted)
    }

    /// The random token guarding this lease.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}
