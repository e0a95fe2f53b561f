//! In-process backend built on concurrent maps.
//!
//! Each operation touches a single map entry, and `DashMap` holds the
//! shard lock for that entry for the whole call, which is what makes
//! [`Backend::record_in_window`] atomic per key.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::trace;

use super::{Backend, StoreResult};

#[derive(Debug, Default)]
struct Window {
    /// Sorted timestamps, duplicates allowed.
    entries: VecDeque<u64>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Log {
    retention_ms: u64,
    /// Keyed by (timestamp, insertion sequence) so equal timestamps coexist.
    records: BTreeMap<(u64, u64), String>,
    next_seq: u64,
}

impl Log {
    /// Drop records at or before `now_ms - retention`.
    fn prune(&mut self, now_ms: u64) {
        if let Some(cutoff) = now_ms.checked_sub(self.retention_ms) {
            self.records = self.records.split_off(&(cutoff.saturating_add(1), 0));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Value {
    value: u64,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Bucket {
    fields: HashMap<String, String>,
    requests: u64,
    expires_at: u64,
}

/// Backend keeping all state in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    windows: DashMap<String, Window>,
    values: DashMap<String, Value>,
    sets: DashMap<String, HashSet<String>>,
    logs: DashMap<String, Log>,
    buckets: DashMap<String, Bucket>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live window keys.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        linked: &[&str],
    ) -> StoreResult<u64> {
        let mut window = self.windows.entry(key.to_string()).or_default();

        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            while window.entries.front().is_some_and(|&ts| ts <= cutoff) {
                window.entries.pop_front();
            }
        }
        let at = window.entries.partition_point(|&ts| ts <= now_ms);
        window.entries.insert(at, now_ms);
        window.expires_at = now_ms.saturating_add(window_ms);

        for linked_key in linked {
            if let Some(mut value) = self.values.get_mut(*linked_key) {
                value.expires_at = Some(window.expires_at);
            }
        }

        let count = window.entries.len() as u64;
        trace!(key = %key, count = count, "Recorded window entry");
        Ok(count)
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<u64>> {
        Ok(self.values.get(key).map(|v| v.value))
    }

    async fn set_value(
        &self,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
        now_ms: u64,
    ) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as u64));
        self.values.insert(key.to_string(), Value { value, expires_at });
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .sets
            .get_mut(set)
            .map(|mut members| members.remove(member))
            .unwrap_or(false))
    }

    async fn set_contains(&self, set: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .sets
            .get(set)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }

    async fn log_append(
        &self,
        log: &str,
        timestamp_ms: u64,
        payload: String,
        retention: Duration,
    ) -> StoreResult<()> {
        let retention_ms = retention.as_millis() as u64;
        let mut log = self.logs.entry(log.to_string()).or_default();
        log.retention_ms = retention_ms;

        let seq = log.next_seq;
        log.next_seq += 1;
        log.records.insert((timestamp_ms, seq), payload);
        log.prune(timestamp_ms);
        Ok(())
    }

    async fn log_recent(&self, log: &str, since_ms: u64, limit: usize) -> StoreResult<Vec<String>> {
        let Some(log) = self.logs.get(log) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .range((since_ms.saturating_add(1), 0)..)
            .rev()
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    async fn bump_bucket(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<u64> {
        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        if bucket.expires_at != 0 && bucket.expires_at <= now_ms {
            *bucket = Bucket::default();
        }
        bucket.requests += 1;
        for (field, value) in fields {
            bucket.fields.insert((*field).to_string(), value.clone());
        }
        bucket.expires_at = now_ms.saturating_add(ttl.as_millis() as u64);
        Ok(bucket.requests)
    }

    async fn read_bucket(&self, key: &str, now_ms: u64) -> StoreResult<HashMap<String, String>> {
        let Some(bucket) = self.buckets.get(key) else {
            return Ok(HashMap::new());
        };
        if bucket.expires_at <= now_ms {
            return Ok(HashMap::new());
        }
        let mut fields = bucket.fields.clone();
        fields.insert("requests".to_string(), bucket.requests.to_string());
        Ok(fields)
    }

    async fn sweep(&self, now_ms: u64) -> StoreResult<usize> {
        let before = self.windows.len() + self.buckets.len() + self.values.len();
        self.windows.retain(|_, w| w.expires_at > now_ms);
        self.buckets.retain(|_, b| b.expires_at > now_ms);
        self.values.retain(|_, v| v.expires_at.map_or(true, |at| at > now_ms));
        let mut removed = before - (self.windows.len() + self.buckets.len() + self.values.len());

        for mut log in self.logs.iter_mut() {
            let len = log.records.len();
            log.prune(now_ms);
            removed += len - log.records.len();
        }
        Ok(removed)
    }
}
