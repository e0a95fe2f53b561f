//! Sliding window counter and per-client adaptive threshold.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::key::ClientKey;
use crate::config::RateLimitingConfig;
use crate::store::{Backend, StoreResult};

/// Thresholds move by a tenth of their value per feedback step (x1.1 / x0.9).
const STEP_DIVISOR: u64 = 10;

/// Bounds and default of the adaptive threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    /// Threshold of a client that has never been adjusted
    pub base: u64,
    pub min: u64,
    pub max: u64,
}

impl ThresholdPolicy {
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self {
            base: config.max_requests,
            min: config.min_threshold,
            max: config.max_threshold,
        }
    }

    /// Next threshold after one feedback step.
    ///
    /// Loosening rounds up and tightening rounds down so small thresholds
    /// still move.
    pub fn adjust(&self, current: u64, healthy: bool) -> u64 {
        if healthy {
            let step = current.div_ceil(STEP_DIVISOR);
            current.saturating_add(step).min(self.max)
        } else {
            let step = current.div_ceil(STEP_DIVISOR);
            current.saturating_sub(step).max(self.min)
        }
    }
}

/// Outcome of one [`WindowedCounter::check_and_record`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowVerdict {
    pub allowed: bool,
    /// Entries in the window after recording this request
    pub count: u64,
    /// Threshold the count was compared against
    pub threshold: u64,
    /// Set when the backend failed and the request was let through blindly
    pub degraded: bool,
}

impl WindowVerdict {
    fn fail_open(threshold: u64) -> Self {
        Self {
            allowed: true,
            count: 0,
            threshold,
            degraded: true,
        }
    }
}

/// Exact per-client request counter over a sliding time window.
///
/// All state lives in the backend, so any number of counters (and
/// processes) can share it.
pub struct WindowedCounter {
    backend: Arc<dyn Backend>,
    policy: ThresholdPolicy,
    idle_expiry: Option<Duration>,
}

impl WindowedCounter {
    pub fn new(backend: Arc<dyn Backend>, policy: ThresholdPolicy) -> Self {
        Self {
            backend,
            policy,
            idle_expiry: None,
        }
    }

    /// Drop a client's adjusted threshold once its window has seen no
    /// request for `idle`. Without this, adjusted thresholds are kept forever.
    pub fn with_idle_expiry(mut self, idle: Duration) -> Self {
        self.idle_expiry = Some(idle);
        self
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    /// Record a request at `now_ms` and compare the window count with the
    /// client's threshold.
    ///
    /// Fails open: when the backend is unreachable the request is allowed
    /// and the verdict is marked degraded.
    pub async fn check_and_record(
        &self,
        key: &ClientKey,
        now_ms: u64,
        window_ms: u64,
    ) -> WindowVerdict {
        match self.try_check_and_record(key, now_ms, window_ms).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(client = %key, error = %e, "Window check failed, allowing request");
                WindowVerdict::fail_open(self.policy.base)
            }
        }
    }

    async fn try_check_and_record(
        &self,
        key: &ClientKey,
        now_ms: u64,
        window_ms: u64,
    ) -> StoreResult<WindowVerdict> {
        let threshold_key = key.threshold_key();
        let threshold_link = [threshold_key.as_str()];
        let linked: &[&str] = if self.idle_expiry.is_some() {
            &threshold_link
        } else {
            &[]
        };
        let count = self
            .backend
            .record_in_window(&key.window_key(), now_ms, window_ms, linked)
            .await?;
        let threshold = self.threshold(key).await?;

        trace!(client = %key, count = count, threshold = threshold, "Checked window");

        Ok(WindowVerdict {
            allowed: count <= threshold,
            count,
            threshold,
            degraded: false,
        })
    }

    /// Current threshold of a client, the base threshold if never adjusted.
    pub async fn threshold(&self, key: &ClientKey) -> StoreResult<u64> {
        Ok(self
            .backend
            .get_value(&key.threshold_key())
            .await?
            .unwrap_or(self.policy.base))
    }

    /// Move the client's threshold one step up (healthy) or down.
    ///
    /// Returns the stored threshold.
    pub async fn adjust_threshold(
        &self,
        key: &ClientKey,
        healthy: bool,
        now_ms: u64,
    ) -> StoreResult<u64> {
        let current = self.threshold(key).await?;
        let next = self.policy.adjust(current, healthy);
        if next != current {
            self.backend
                .set_value(&key.threshold_key(), next, self.idle_expiry, now_ms)
                .await?;
            debug!(
                client = %key,
                from = current,
                to = next,
                healthy = healthy,
                "Adjusted threshold"
            );
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::SwitchableBackend;
    use crate::store::MemoryBackend;

    const WINDOW_MS: u64 = 60_000;

    fn policy() -> ThresholdPolicy {
        ThresholdPolicy {
            base: 100,
            min: 10,
            max: 1000,
        }
    }

    fn counter() -> WindowedCounter {
        WindowedCounter::new(Arc::new(MemoryBackend::new()), policy())
    }

    #[test]
    fn test_policy_adjust_steps() {
        let policy = policy();
        assert_eq!(policy.adjust(100, true), 110);
        assert_eq!(policy.adjust(100, false), 90);
        assert_eq!(policy.adjust(995, true), 1000);
        assert_eq!(policy.adjust(11, false), 10);
        // small values still move when loosening
        assert_eq!(policy.adjust(10, true), 11);
    }

    #[tokio::test]
    async fn test_over_limit_then_recovers_after_window() {
        let counter = counter();
        let key = ClientKey::from("10.0.0.1");
        let start = 1_700_000_000_000;

        // 101 requests spread over 10 seconds
        for i in 0..100u64 {
            let verdict = counter.check_and_record(&key, start + i * 100, WINDOW_MS).await;
            assert!(verdict.allowed, "request {} should be allowed", i + 1);
        }
        let last = start + 10_000;
        let verdict = counter.check_and_record(&key, last, WINDOW_MS).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.count, 101);
        assert_eq!(verdict.threshold, 100);

        let verdict = counter.check_and_record(&key, last + 61_000, WINDOW_MS).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.count, 1);
    }

    #[tokio::test]
    async fn test_window_count_never_exceeds_threshold_when_allowed() {
        let counter = counter();
        let key = ClientKey::from("burst");
        let start = 5_000_000;

        // Requests every 250ms for three windows: at most 100 allowed per window
        let mut allowed_at = Vec::new();
        for i in 0..720u64 {
            let now = start + i * 250;
            if counter.check_and_record(&key, now, WINDOW_MS).await.allowed {
                allowed_at.push(now);
            }
        }

        for (idx, &t) in allowed_at.iter().enumerate() {
            let in_window = allowed_at[..=idx]
                .iter()
                .filter(|&&s| s > t.saturating_sub(WINDOW_MS))
                .count();
            assert!(in_window <= 100, "{} allowed within one window", in_window);
        }
    }

    #[tokio::test]
    async fn test_threshold_defaults_to_base() {
        let counter = counter();
        let key = ClientKey::from("fresh");
        assert_eq!(counter.threshold(&key).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_threshold_bounded_both_ways() {
        let counter = counter();
        let key = ClientKey::from("adaptive");

        let mut last = 100;
        for _ in 0..100 {
            let next = counter.adjust_threshold(&key, true, 0).await.unwrap();
            assert!(next >= last && next <= 1000);
            last = next;
        }
        assert_eq!(last, 1000);

        for _ in 0..100 {
            let next = counter.adjust_threshold(&key, false, 0).await.unwrap();
            assert!(next <= last && next >= 10);
            last = next;
        }
        assert_eq!(last, 10);
        assert_eq!(counter.threshold(&key).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_adjusted_threshold_is_enforced() {
        let counter = counter();
        let key = ClientKey::from("tight");
        for _ in 0..30 {
            counter.adjust_threshold(&key, false, 0).await.unwrap();
        }

        for i in 0..10u64 {
            assert!(counter.check_and_record(&key, 1_000 + i, WINDOW_MS).await.allowed);
        }
        assert!(!counter.check_and_record(&key, 1_010, WINDOW_MS).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_backend_down() {
        let backend = Arc::new(SwitchableBackend::unavailable());
        let counter = WindowedCounter::new(backend, policy());
        let key = ClientKey::from("anyone");

        for i in 0..500u64 {
            let verdict = counter.check_and_record(&key, i, WINDOW_MS).await;
            assert!(verdict.allowed);
            assert!(verdict.degraded);
        }
        assert!(counter.adjust_threshold(&key, true, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_client_threshold_reverts_to_base() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = WindowedCounter::new(backend.clone(), policy())
            .with_idle_expiry(Duration::from_millis(WINDOW_MS));
        let key = ClientKey::from("idle");
        let start = 1_700_000_000_000;

        counter.check_and_record(&key, start, WINDOW_MS).await;
        assert_eq!(counter.adjust_threshold(&key, false, start).await.unwrap(), 90);

        // still active: the window keeps the threshold alive past its own ttl
        let later = start + WINDOW_MS - 1;
        counter.check_and_record(&key, later, WINDOW_MS).await;
        backend.sweep(start + WINDOW_MS + 1).await.unwrap();
        assert_eq!(counter.threshold(&key).await.unwrap(), 90);

        backend.sweep(later + WINDOW_MS).await.unwrap();
        assert_eq!(counter.threshold(&key).await.unwrap(), 100);
        assert_eq!(backend.window_count(), 0);
    }
}
