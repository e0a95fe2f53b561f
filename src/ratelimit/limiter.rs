//! Two-tier adaptive rate limiter.
//!
//! Every request first bumps a count-min sketch. Clients whose estimate stays
//! at or under the suspicious threshold are let through without touching the
//! backend. Above it, blocked clients are rejected, the rest go through the
//! exact sliding window, and exceeding the window blocks the client for good.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::blocklist::BlockRegistry;
use super::estimator::FrequencyEstimator;
use super::key::{ClientKey, RequestMeta};
use super::latency::{LatencySampler, LoadSignal};
use super::window::{ThresholdPolicy, WindowedCounter};
use crate::clock::Clock;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::store::Backend;
use crate::telemetry::{DecisionRecord, TelemetryEvent, TelemetryHub};

/// HTTP status returned to rejected clients.
pub const REJECT_STATUS: u16 = 429;

/// How a request was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Estimate under the suspicious threshold
    FastPath,
    /// Suspicious but within the client's window threshold
    WithinLimit,
    /// Backend failed, let through
    Degraded,
    /// Client is on the block list
    Blocked,
    /// Client just exceeded its window threshold and got blocked
    OverLimit,
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            Outcome::FastPath | Outcome::WithinLimit | Outcome::Degraded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::FastPath => "fast_path",
            Outcome::WithinLimit => "within_limit",
            Outcome::Degraded => "degraded",
            Outcome::Blocked => "blocked",
            Outcome::OverLimit => "over_limit",
        }
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// Sketch estimate after counting this request
    pub estimated_count: u64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.outcome.is_allowed()
    }

    /// Status the host should answer with; 200 means "continue to the handler".
    pub fn status_code(&self) -> u16 {
        if self.allowed() {
            200
        } else {
            REJECT_STATUS
        }
    }

    /// JSON body for rejected requests.
    pub fn error_body(&self) -> Option<String> {
        if self.allowed() {
            None
        } else {
            Some(serde_json::json!({ "error": "Too Many Requests" }).to_string())
        }
    }
}

/// The per-request enforcement engine.
///
/// Thread-safe; share it behind an `Arc`.
pub struct AdaptiveLimiter {
    estimator: FrequencyEstimator,
    window: WindowedCounter,
    blocklist: BlockRegistry,
    latency: LatencySampler,
    clock: Arc<dyn Clock>,
    telemetry: Option<Arc<TelemetryHub>>,
    window_ms: u64,
    suspicious_threshold: u64,
}

impl AdaptiveLimiter {
    /// Build a limiter from configuration.
    pub fn new(
        config: &RateLimitingConfig,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let estimator = FrequencyEstimator::new(config.epsilon, config.delta)?;
        let window = WindowedCounter::new(backend.clone(), ThresholdPolicy::from_config(config))
            .with_idle_expiry(Duration::from_millis(config.window_ms));
        let blocklist = BlockRegistry::new(backend, clock.clone(), config.attempt_retention());
        let latency = LatencySampler::new(
            clock.clone(),
            Duration::from_millis(config.latency_sample_interval_ms),
            Duration::from_millis(config.high_latency_ms),
            Duration::from_millis(config.low_latency_ms),
        );

        debug!(
            width = estimator.width(),
            depth = estimator.depth(),
            suspicious_threshold = config.suspicious_threshold,
            window_ms = config.window_ms,
            "Adaptive limiter created"
        );

        Ok(Self {
            estimator,
            window,
            blocklist,
            latency,
            clock,
            telemetry: None,
            window_ms: config.window_ms,
            suspicious_threshold: config.suspicious_threshold,
        })
    }

    /// Publish every decision to `hub`.
    pub fn with_telemetry(mut self, hub: Arc<TelemetryHub>) -> Self {
        self.telemetry = Some(hub);
        self
    }

    /// Replace the pre-filter sketch.
    pub fn with_estimator(mut self, estimator: FrequencyEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn blocklist(&self) -> &BlockRegistry {
        &self.blocklist
    }

    pub fn window(&self) -> &WindowedCounter {
        &self.window
    }

    /// Feed back how long a finished request took to handle.
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    /// Decide whether `request` may reach the application.
    pub async fn check(&self, request: &RequestMeta) -> Decision {
        let key = &request.client;
        let estimated_count = self.estimator.update(key.as_str(), 1);

        trace!(client = %key, estimate = estimated_count, "Pre-filter estimate");

        let outcome = if estimated_count <= self.suspicious_threshold {
            Outcome::FastPath
        } else {
            self.check_suspicious(request).await
        };

        let decision = Decision {
            outcome,
            estimated_count,
        };
        self.report(key, decision);
        decision
    }

    async fn check_suspicious(&self, request: &RequestMeta) -> Outcome {
        let key = &request.client;

        match self.blocklist.is_blocked(key).await {
            Ok(true) => {
                self.blocklist.log_attempt(request).await;
                return Outcome::Blocked;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(client = %key, error = %e, "Block list unavailable, allowing request");
                self.feedback(key, true).await;
                return Outcome::Degraded;
            }
        }

        let verdict = self
            .window
            .check_and_record(key, self.clock.now_ms(), self.window_ms)
            .await;

        if verdict.degraded {
            self.feedback(key, true).await;
            return Outcome::Degraded;
        }

        if !verdict.allowed {
            warn!(
                client = %key,
                count = verdict.count,
                threshold = verdict.threshold,
                "Rate limit exceeded, blocking client"
            );
            // The window already proved the client over its limit, so a
            // failed block write still rejects this request.
            if let Err(e) = self.blocklist.block(key).await {
                warn!(client = %key, error = %e, "Failed to block client");
            }
            self.blocklist.log_attempt(request).await;
            return Outcome::OverLimit;
        }

        match self.latency.signal() {
            LoadSignal::Overloaded => self.feedback(key, false).await,
            LoadSignal::Idle => self.feedback(key, true).await,
            LoadSignal::Steady => {}
        }
        Outcome::WithinLimit
    }

    async fn feedback(&self, key: &ClientKey, healthy: bool) {
        if let Err(e) = self
            .window
            .adjust_threshold(key, healthy, self.clock.now_ms())
            .await {
            warn!(client = %key, healthy = healthy, error = %e, "Threshold adjustment failed");
        }
    }

    fn report(&self, key: &ClientKey, decision: Decision) {
        debug!(
            client = %key,
            outcome = decision.outcome.as_str(),
            estimate = decision.estimated_count,
            "Rate limit decision made"
        );

        if let Some(hub) = &self.telemetry {
            hub.publish(TelemetryEvent::Decision(DecisionRecord {
                client: key.clone(),
                timestamp_ms: self.clock.now_ms(),
                outcome: decision.outcome,
                estimated_count: decision.estimated_count,
            }));
        }
    }
}
