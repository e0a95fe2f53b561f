//! Blocked clients and the log of their rejected attempts.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::key::{ClientKey, RequestMeta};
use crate::clock::Clock;
use crate::store::{Backend, StoreResult};

/// Set holding every blocked client.
const BLOCKED_SET: &str = "blocked:ips";
/// Timestamp-ordered log of attempts made by blocked clients.
const ATTEMPT_LOG: &str = "blocked:requests";

/// One rejected attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub client: ClientKey,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Registry of blocked clients.
///
/// Membership never expires; only [`BlockRegistry::unblock`] lifts a block.
/// Attempt records expire after the configured retention.
pub struct BlockRegistry {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl BlockRegistry {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            backend,
            clock,
            retention,
        }
    }

    /// Block a client. Blocking an already blocked client is a no-op.
    pub async fn block(&self, key: &ClientKey) -> StoreResult<()> {
        if self.backend.set_add(BLOCKED_SET, key.as_str()).await? {
            info!(client = %key, "Client blocked");
        }
        Ok(())
    }

    /// Lift a block. Returns whether the client was blocked.
    pub async fn unblock(&self, key: &ClientKey) -> StoreResult<bool> {
        let removed = self.backend.set_remove(BLOCKED_SET, key.as_str()).await?;
        if removed {
            info!(client = %key, "Client unblocked");
        }
        Ok(removed)
    }

    pub async fn is_blocked(&self, key: &ClientKey) -> StoreResult<bool> {
        self.backend.set_contains(BLOCKED_SET, key.as_str()).await
    }

    /// Record an attempt by a blocked client.
    ///
    /// Best effort: failures are logged and dropped.
    pub async fn log_attempt(&self, request: &RequestMeta) {
        let now_ms = self.clock.now_ms();
        let record = AttemptRecord {
            id: Uuid::new_v4(),
            client: request.client.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            timestamp: Utc
                .timestamp_millis_opt(now_ms as i64)
                .single()
                .unwrap_or_else(Utc::now),
        };

        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(client = %request.client, error = %e, "Failed to encode blocked attempt");
                return;
            }
        };

        if let Err(e) = self
            .backend
            .log_append(ATTEMPT_LOG, now_ms, payload, self.retention)
            .await
        {
            warn!(client = %request.client, error = %e, "Failed to log blocked attempt");
        }
    }

    /// Most recent attempts still within retention, newest first.
    pub async fn recent_attempts(&self, limit: usize) -> StoreResult<Vec<AttemptRecord>> {
        let since = self
            .clock
            .now_ms()
            .saturating_sub(self.retention.as_millis() as u64);
        let raw = self.backend.log_recent(ATTEMPT_LOG, since, limit).await?;

        Ok(raw
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable attempt record");
                    None
                }
            })
            .collect())
    }
}
