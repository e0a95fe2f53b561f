//! Shared key-value backend.
//!
//! The rate limiting components never lock anything themselves: every
//! read-modify-write that must be atomic is a single [`Backend`] call, and
//! the backend is responsible for running it as one unit (a per-key entry
//! lock in process, a MULTI/EXEC transaction in Redis).

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a key-value backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type alias for backend operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the engine needs from its key-value store.
///
/// Keys are plain strings; the layout is owned by the callers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Drop entries of the window at `key` with a timestamp at or before
    /// `now_ms - window_ms`, add one entry at `now_ms` and return the number
    /// of entries left. Runs atomically per key. The window expires after
    /// `window_ms` of inactivity, and so does every existing value named in
    /// `linked`.
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        linked: &[&str],
    ) -> StoreResult<u64>;

    /// Read an integer value.
    ///
    /// Backends without native expiry may still return an expired value
    /// until the next [`Backend::sweep`].
    async fn get_value(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Write an integer value, expiring `ttl` after `now_ms` if given.
    async fn set_value(
        &self,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
        now_ms: u64,
    ) -> StoreResult<()>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn set_add(&self, set: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set. Returns whether it was present.
    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool>;

    async fn set_contains(&self, set: &str, member: &str) -> StoreResult<bool>;

    /// Append a record to a timestamp-ordered log, dropping records older
    /// than `retention` relative to `timestamp_ms`.
    async fn log_append(
        &self,
        log: &str,
        timestamp_ms: u64,
        payload: String,
        retention: Duration,
    ) -> StoreResult<()>;

    /// Records newer than `since_ms`, most recent first, at most `limit`.
    async fn log_recent(&self, log: &str, since_ms: u64, limit: usize) -> StoreResult<Vec<String>>;

    /// Increment the `requests` counter of the hash at `key`, overwrite the
    /// given fields and (re)arm its expiry. Returns the new counter value.
    async fn bump_bucket(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<u64>;

    /// Read all fields of a hash. Expired or missing hashes read as empty.
    async fn read_bucket(&self, key: &str, now_ms: u64) -> StoreResult<HashMap<String, String>>;

    /// Remove entries that have expired. Returns how many were removed.
    ///
    /// Backends with native expiry have nothing to do here.
    async fn sweep(&self, _now_ms: u64) -> StoreResult<usize> {
        Ok(0)
    }
}
