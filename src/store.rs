//! Redis client for the shared store.
//!
//! One [`ConnectionManager`] (automatic reconnection) serves every command;
//! the underlying [`Client`] is kept around because pub/sub needs dedicated
//! connections.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::CacheResult;

/// Delete `KEYS[1]` only when it still holds `ARGV[1]`. Used for lock
/// release so a lease that expired and was re-acquired elsewhere is never
/// deleted by the previous holder.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end"#;

/// Default page size for cursor-based SCAN.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

/// Async Redis handle exposing the primitive set the cache tiers build on.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    scan_page_size: usize,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str, scan_page_size: usize) -> CacheResult<Self> {
        info!(redis_url = %redis_url, "connecting to shared store");
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut probe).await?;

        Ok(Self {
            client,
            conn,
            scan_page_size,
        })
    }

    /// The underlying client, for pub/sub connections.
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Liveness probe.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    /// GET. `None` when the key is absent.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    /// SET with expiry.
    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "stored key");
        Ok(())
    }

    /// `SET key value NX EX ttl` — true when the key was absent and is now
    /// set. The conditional write the lease lock is built on.
    pub async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    /// DEL a single key.
    pub async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// DEL a batch of keys; returns how many existed.
    pub async fn del_many(&self, keys: &[String]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(keys).await?;
        debug!(removed, "removed keys in bulk");
        Ok(removed)
    }

    /// EXISTS.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let present: bool = conn.exists(key).await?;
        Ok(present)
    }

    /// Remaining TTL in seconds: `-1` means no expiry, `-2` a missing key.
    pub async fn ttl_secs(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    /// EXPIRE — true when the key existed and the TTL was set.
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let applied: bool = conn.expire(key, secs).await?;
        Ok(applied)
    }

    /// Collect every key matching a glob pattern via cursor-based SCAN
    /// (non-blocking, unlike KEYS).
    pub async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_page_size)
                .query_async(&mut conn)
                .await?;

            cursor = next;
            keys.extend(page);

            // Cursor 0 means the iteration is complete.
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "scanned keys");
        Ok(keys)
    }

    /// Atomically delete `key` when it still holds `token`; true when the
    /// delete happened.
    pub async fn compare_and_delete(&self, key: &str, token: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    /// PUBLISH a payload on a channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}
