//! Redis-backed storage, shared by every enforcement instance pointed at it.
//!
//! Multi-step updates run as MULTI/EXEC pipelines so concurrent instances
//! never observe a half-pruned window.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::{Backend, StoreError, StoreResult};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Backend talking to a Redis server.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        linked: &[&str],
    ) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        // Unique members so requests landing in the same millisecond all count.
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            pipe.zrembyscore(key, 0, cutoff).ignore();
        }
        pipe.zadd(key, member, now_ms)
            .ignore()
            .zcard(key)
            .pexpire(key, window_ms as i64)
            .ignore();
        // PEXPIRE on a missing key is a no-op
        for linked_key in linked {
            pipe.pexpire(*linked_key, window_ms as i64).ignore();
        }

        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|v| {
            v.parse::<u64>().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn set_value(
        &self,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
        _now_ms: u64,
    ) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                conn.pset_ex::<_, _, ()>(key, value, ttl.as_millis().max(1) as u64)
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let added: i64 = conn.sadd(set, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.srem(set, member).await?;
        Ok(removed > 0)
    }

    async fn set_contains(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        Ok(conn.sismember(set, member).await?)
    }

    async fn log_append(
        &self,
        log: &str,
        timestamp_ms: u64,
        payload: String,
        retention: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(cutoff) = timestamp_ms.checked_sub(retention.as_millis() as u64) {
            pipe.zrembyscore(log, 0, cutoff).ignore();
        }
        pipe.zadd(log, payload, timestamp_ms).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn log_recent(&self, log: &str, since_ms: u64, limit: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let min = format!("({}", since_ms);
        Ok(conn
            .zrevrangebyscore_limit(log, "+inf", min, 0, limit as isize)
            .await?)
    }

    async fn bump_bucket(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
        _now_ms: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hincr(key, "requests", 1);
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        pipe.expire(key, ttl.as_secs() as i64).ignore();
        let (requests,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(requests)
    }

    async fn read_bucket(&self, key: &str, _now_ms: u64) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        Ok(conn.hgetall(key).await?)
    }
}
