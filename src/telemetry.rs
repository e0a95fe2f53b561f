//! Metrics events published by the core.
//!
//! Producers only push [`TelemetryEvent`]s into a broadcast channel; whatever
//! transport fans them out (a dashboard socket, a log shipper) subscribes on
//! its own. Probe results are also kept as per-minute buckets in the backend
//! for an hour so out-of-process readers can aggregate them.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::ratelimit::{ClientKey, Outcome};
use crate::store::{Backend, StoreResult};

/// Default number of events buffered for slow subscribers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Retention of per-minute probe buckets.
const BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Result of one upstream probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub url: String,
    pub timestamp_ms: u64,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error: Option<String>,
}

/// One enforcement decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRecord {
    pub client: ClientKey,
    pub timestamp_ms: u64,
    pub outcome: Outcome,
    pub estimated_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Probe(ProbeRecord),
    Decision(DecisionRecord),
}

/// Per-minute probe statistics of one site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteMetrics {
    pub url: String,
    pub requests_per_minute: u64,
    pub last_response_time_ms: u64,
    pub last_status_code: u16,
}

/// Broadcast hub for telemetry events.
pub struct TelemetryHub {
    sender: broadcast::Sender<TelemetryEvent>,
    backend: Option<Arc<dyn Backend>>,
}

impl TelemetryHub {
    /// Hub that only broadcasts.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            backend: None,
        }
    }

    /// Hub that also persists probe buckets in `backend`.
    pub fn with_backend(backend: Arc<dyn Backend>, capacity: usize) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(capacity)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn publish(&self, event: TelemetryEvent) {
        if self.sender.send(event).is_err() {
            trace!("No telemetry subscribers");
        }
    }

    /// Persist a probe result and broadcast it.
    pub async fn record_probe(&self, record: ProbeRecord) {
        if let Some(backend) = &self.backend {
            let fields = [
                ("last_response_time", record.latency_ms.to_string()),
                (
                    "last_status_code",
                    record.status_code.unwrap_or_default().to_string(),
                ),
            ];
            let key = bucket_key(&record.url, record.timestamp_ms);
            if let Err(e) = backend
                .bump_bucket(&key, &fields, BUCKET_TTL, record.timestamp_ms)
                .await
            {
                warn!(url = %record.url, error = %e, "Failed to persist probe metrics");
            }
        }
        self.publish(TelemetryEvent::Probe(record));
    }

    /// Probe statistics of `url` for the minute containing `now_ms`.
    pub async fn site_metrics(&self, url: &str, now_ms: u64) -> StoreResult<SiteMetrics> {
        let Some(backend) = &self.backend else {
            return Ok(SiteMetrics {
                url: url.to_string(),
                ..Default::default()
            });
        };
        let fields = backend.read_bucket(&bucket_key(url, now_ms), now_ms).await?;
        let number = |name: &str| fields.get(name).and_then(|v| v.parse().ok());

        Ok(SiteMetrics {
            url: url.to_string(),
            requests_per_minute: number("requests").unwrap_or(0),
            last_response_time_ms: number("last_response_time").unwrap_or(0),
            last_status_code: number("last_status_code").map(|v| v as u16).unwrap_or(0),
        })
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn bucket_key(url: &str, timestamp_ms: u64) -> String {
    format!("website:{}:{}", url, timestamp_ms / 60_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn probe(url: &str, timestamp_ms: u64, latency_ms: u64) -> ProbeRecord {
        ProbeRecord {
            url: url.to_string(),
            timestamp_ms,
            latency_ms,
            status_code: Some(200),
            success: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let hub = TelemetryHub::default();
        let mut rx = hub.subscribe();

        hub.record_probe(probe("https://a.test", 1_000, 42)).await;

        match rx.recv().await.unwrap() {
            TelemetryEvent::Probe(record) => assert_eq!(record.latency_ms, 42),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = TelemetryHub::new(4);
        hub.publish(TelemetryEvent::Decision(DecisionRecord {
            client: ClientKey::from("x"),
            timestamp_ms: 0,
            outcome: Outcome::FastPath,
            estimated_count: 1,
        }));
    }

    #[tokio::test]
    async fn test_probe_buckets_per_minute() {
        let hub = TelemetryHub::with_backend(Arc::new(MemoryBackend::new()), 16);
        let minute = 28_333_333 * 60_000;

        hub.record_probe(probe("https://a.test", minute + 1_000, 120)).await;
        hub.record_probe(probe("https://a.test", minute + 6_000, 80)).await;
        hub.record_probe(probe("https://b.test", minute + 7_000, 10)).await;

        let metrics = hub.site_metrics("https://a.test", minute + 30_000).await.unwrap();
        assert_eq!(metrics.requests_per_minute, 2);
        assert_eq!(metrics.last_response_time_ms, 80);
        assert_eq!(metrics.last_status_code, 200);

        // next minute starts a fresh bucket
        let metrics = hub.site_metrics("https://a.test", minute + 60_000).await.unwrap();
        assert_eq!(metrics.requests_per_minute, 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = TelemetryEvent::Probe(probe("https://a.test", 5, 7));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "probe");
        assert_eq!(json["url"], "https://a.test");
    }
}
