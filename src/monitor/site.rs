//! Periodic probing of upstream sites.
//!
//! Every target gets its own task that probes, records the result, feeds
//! the alert engine and sleeps for the probe interval. Stopping is
//! cooperative: the flag is checked at the top of each iteration and a
//! probe already in flight is allowed to finish.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::alert::{Alert, AlertEngine, AlertRule, AlertSink, ProbeOutcome};
use super::probe::Prober;
use crate::clock::Clock;
use crate::config::TargetConfig;
use crate::telemetry::{ProbeRecord, TelemetryHub};

const MINUTE_MS: u64 = 60_000;

/// Probe counters of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub successes: u64,
    pub errors: u64,
    pub last_response_time_ms: Option<u64>,
}

/// Aggregate view over all probes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub successes: u64,
    pub errors: u64,
    /// Probes finished during the last minute
    pub last_minute: u64,
    /// Share of successful probes, in percent
    pub success_rate: f64,
    /// Mean over the alert windows of all targets
    pub average_response_time_ms: Option<f64>,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    successes: u64,
    errors: u64,
    endpoints: BTreeMap<String, EndpointStats>,
    recent: VecDeque<u64>,
}

/// Running probe counters.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    inner: Mutex<MetricsInner>,
}

impl MonitorMetrics {
    fn track(&self, url: &str) {
        self.inner.lock().endpoints.entry(url.to_string()).or_default();
    }

    fn record(&self, url: &str, now_ms: u64, latency_ms: Option<u64>) {
        let mut inner = self.inner.lock();
        let endpoint = inner.endpoints.entry(url.to_string()).or_default();
        match latency_ms {
            Some(ms) => {
                endpoint.successes += 1;
                endpoint.last_response_time_ms = Some(ms);
                inner.successes += 1;
            }
            None => {
                endpoint.errors += 1;
                inner.errors += 1;
            }
        }
        inner.recent.push_back(now_ms);
        prune(&mut inner.recent, now_ms);
    }

    fn snapshot(&self, now_ms: u64) -> MonitorSnapshot {
        let mut inner = self.inner.lock();
        prune(&mut inner.recent, now_ms);

        let total = inner.successes + inner.errors;
        let success_rate = if total == 0 {
            100.0
        } else {
            inner.successes as f64 * 100.0 / total as f64
        };
        MonitorSnapshot {
            successes: inner.successes,
            errors: inner.errors,
            last_minute: inner.recent.len() as u64,
            success_rate,
            average_response_time_ms: None,
            endpoints: inner.endpoints.clone(),
        }
    }
}

fn prune(recent: &mut VecDeque<u64>, now_ms: u64) {
    if let Some(cutoff) = now_ms.checked_sub(MINUTE_MS) {
        while recent.front().is_some_and(|&at| at <= cutoff) {
            recent.pop_front();
        }
    }
}

struct Shared {
    prober: Arc<dyn Prober>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    engine: AlertEngine,
    metrics: MonitorMetrics,
    telemetry: Option<Arc<TelemetryHub>>,
}

impl Shared {
    async fn probe_target(&self, target: &TargetConfig) -> Option<Alert> {
        let url = target.probe_url();
        let result = self.prober.probe(&url).await;
        let now_ms = self.clock.now_ms();

        let (record, outcome) = match result {
            Ok(response) => {
                let latency_ms = response.latency.as_millis() as u64;
                debug!(url = %url, latency_ms, status = response.status_code, "Probe succeeded");
                self.metrics.record(&target.url, now_ms, Some(latency_ms));
                (
                    ProbeRecord {
                        url: target.url.clone(),
                        timestamp_ms: now_ms,
                        latency_ms,
                        status_code: Some(response.status_code),
                        success: true,
                        error: None,
                    },
                    ProbeOutcome::Latency(latency_ms),
                )
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Probe failed");
                self.metrics.record(&target.url, now_ms, None);
                (
                    ProbeRecord {
                        url: target.url.clone(),
                        timestamp_ms: now_ms,
                        latency_ms: 0,
                        status_code: e.status_code(),
                        success: false,
                        error: Some(e.to_string()),
                    },
                    ProbeOutcome::Failure(e.to_string()),
                )
            }
        };

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_probe(record).await;
        }

        let alert = self
            .engine
            .observe(&target.url, &AlertRule::from(target), outcome, now_ms)?;
        self.sink.emit(&alert);
        Some(alert)
    }
}

/// Monitors a set of upstream sites.
pub struct SiteMonitor {
    shared: Arc<Shared>,
    interval: Duration,
    running: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SiteMonitor {
    pub fn new(
        prober: Arc<dyn Prober>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                prober,
                sink,
                clock,
                engine: AlertEngine::new(),
                metrics: MonitorMetrics::default(),
                telemetry: None,
            }),
            interval,
            running,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Publish probe results to `telemetry`. Must be called before `start`.
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryHub>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.telemetry = Some(telemetry);
        }
        self
    }

    pub fn engine(&self) -> &AlertEngine {
        &self.shared.engine
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Spawn one probe loop per target.
    pub fn start(&self, targets: Vec<TargetConfig>) {
        self.running.send_replace(true);
        let mut tasks = self.tasks.lock();

        for target in targets {
            self.shared.metrics.track(&target.url);
            info!(url = %target.url, interval = ?self.interval, "Monitoring target");

            let shared = Arc::clone(&self.shared);
            let mut running = self.running.subscribe();
            let interval = self.interval;
            tasks.push(tokio::spawn(async move {
                while *running.borrow_and_update() {
                    shared.probe_target(&target).await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        changed = running.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!(url = %target.url, "Probe loop stopped");
            }));
        }
    }

    /// Probe one target right away, outside the loops.
    pub async fn probe_now(&self, target: &TargetConfig) -> Option<Alert> {
        self.shared.probe_target(target).await
    }

    /// Stop all loops and wait for them to finish.
    pub async fn stop(&self) {
        self.running.send_replace(false);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Probe loop ended abnormally");
            }
        }
        info!("Site monitor stopped");
    }

    pub fn metrics(&self) -> MonitorSnapshot {
        let mut snapshot = self.shared.metrics.snapshot(self.shared.clock.now_ms());
        snapshot.average_response_time_ms = self.shared.engine.mean_latency();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::monitor::alert::AlertReason;
    use crate::monitor::probe::{ProbeError, ProbeResponse};
    use crate::telemetry::TelemetryEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results, then keeps answering with the last one.
    struct ScriptedProber {
        script: Mutex<VecDeque<std::result::Result<u64, ProbeError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(script: Vec<std::result::Result<u64, ProbeError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _url: &str) -> std::result::Result<ProbeResponse, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            next.unwrap_or(Ok(1)).map(|ms| ProbeResponse {
                status_code: 200,
                latency: Duration::from_millis(ms),
            })
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl AlertSink for CollectingSink {
        fn emit(&self, alert: &Alert) {
            self.alerts.lock().push(alert.clone());
        }
    }

    fn target(url: &str) -> TargetConfig {
        TargetConfig {
            url: url.to_string(),
            path: "/health".to_string(),
            alert_threshold_ms: 200,
            min_alert_count: 3,
            cooldown_ms: 300_000,
        }
    }

    #[tokio::test]
    async fn test_slow_target_alerts_once() {
        let prober = Arc::new(ScriptedProber::new(
            [250, 260, 240, 255, 245].into_iter().map(Ok).collect(),
        ));
        let sink = Arc::new(CollectingSink::default());
        let clock = ManualClock::new(1_000_000);
        let monitor = SiteMonitor::new(
            prober,
            sink.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        );

        let target = target("https://slow.test");
        for _ in 0..5 {
            monitor.probe_now(&target).await;
            clock.advance_ms(5_000);
        }

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].reason, AlertReason::HighLatency { .. }));
        assert_eq!(alerts[0].timestamp_ms, 1_010_000);
    }

    #[tokio::test]
    async fn test_failures_count_as_errors() {
        let prober = Arc::new(ScriptedProber::new(vec![
            Ok(40),
            Err(ProbeError::Status(503)),
            Ok(60),
        ]));
        let sink = Arc::new(CollectingSink::default());
        let clock = ManualClock::new(1_000_000);
        let monitor = SiteMonitor::new(
            prober,
            sink.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        );

        let target = target("https://flaky.test");
        for _ in 0..3 {
            monitor.probe_now(&target).await;
            clock.advance_ms(1_000);
        }

        let snapshot = monitor.metrics();
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.last_minute, 3);
        assert!((snapshot.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.average_response_time_ms, Some(50.0));
        assert_eq!(
            snapshot.endpoints["https://flaky.test"].last_response_time_ms,
            Some(60)
        );

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].reason,
            AlertReason::Down {
                error: "unexpected status 503".into()
            }
        );

        clock.advance_ms(MINUTE_MS);
        drop(alerts);
        assert_eq!(monitor.metrics().last_minute, 0);
    }

    #[tokio::test]
    async fn test_probe_results_reach_telemetry() {
        let hub = Arc::new(TelemetryHub::default());
        let mut rx = hub.subscribe();
        let monitor = SiteMonitor::new(
            Arc::new(ScriptedProber::new(vec![Err(ProbeError::Timeout(
                Duration::from_secs(5),
            ))])),
            Arc::new(CollectingSink::default()),
            Arc::new(ManualClock::new(7)),
            Duration::from_secs(5),
        )
        .with_telemetry(hub);

        monitor.probe_now(&target("https://down.test")).await;

        match rx.recv().await.unwrap() {
            TelemetryEvent::Probe(record) => {
                assert_eq!(record.url, "https://down.test");
                assert!(!record.success);
                assert_eq!(record.timestamp_ms, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_loops() {
        let prober = Arc::new(ScriptedProber::new(vec![Ok(5)]));
        let monitor = SiteMonitor::new(
            prober.clone(),
            Arc::new(CollectingSink::default()),
            Arc::new(SystemClock),
            Duration::from_millis(10),
        );

        monitor.start(vec![target("https://a.test"), target("https://b.test")]);
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let probes = prober.calls.load(Ordering::SeqCst);
        assert!(probes >= 2);

        // no loop survives stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), probes);
        assert_eq!(monitor.metrics().endpoints.len(), 2);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = MonitorMetrics::default();
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.success_rate, 100.0);
        assert_eq!(snapshot.last_minute, 0);
    }
}
