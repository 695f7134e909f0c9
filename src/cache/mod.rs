//! Shared key-value store client.
//!
//! One multiplexed connection cloned per use. All cross-replica
//! coordination (rate windows, the spend queue and its lease, deployment
//! cache entries) goes through here; process memory holds no locks.

mod keys;

pub use keys::CacheKeys;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use thiserror::Error;

use crate::config::RedisConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Clone)]
pub struct Cache {
    conn: MultiplexedConnection,
}

impl Cache {
    pub async fn connect(config: &RedisConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn set_string(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    /// SCAN + DEL over a glob pattern. Returns the number of keys removed.
    pub async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    /// One round trip for the sliding-window limiter: read the previous
    /// window, increment the current one, refresh its TTL. The INCR is the
    /// authoritative write; atomicity across the three is not required.
    pub async fn window_read_and_incr(
        &self,
        prev_key: &str,
        curr_key: &str,
        ttl_secs: i64,
    ) -> CacheResult<(i64, i64)> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.get(prev_key);
        pipe.incr(curr_key, 1i64);
        pipe.expire(curr_key, ttl_secs).ignore();
        let (prev, curr): (Option<i64>, i64) = pipe.query_async(&mut conn).await?;
        Ok((prev.unwrap_or(0), curr))
    }

    /// Roll back a rejected rate-limit increment.
    pub async fn decr(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.decr(key, 1i64).await?;
        Ok(())
    }

    pub async fn lpush(&self, key: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(key, value).await?;
        Ok(())
    }

    pub async fn llen(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    /// Pop up to `count` values in one pipelined batch. Holes (queue ran
    /// dry mid-pipeline) are dropped.
    pub async fn rpop_batch(&self, key: &str, count: usize) -> CacheResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for _ in 0..count {
            pipe.rpop(key, None);
        }
        let popped: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(popped.into_iter().flatten().collect())
    }

    /// `SET key value PX ttl NX`: the distributed drain lease.
    pub async fn try_lock(&self, key: &str, ttl_ms: u64) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("PX")
            .arg(ttl_ms)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn unlock(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
