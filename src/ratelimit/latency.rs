//! Rolling sample of request handling latency.
//!
//! The rate decision runs before the handler, so the feedback signal can only
//! come from requests that already finished. Hosts report each handler
//! duration once the response is out and the limiter reads the mean over a
//! short trailing interval.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Upper bound on retained samples regardless of the interval.
const MAX_SAMPLES: usize = 1024;

/// How the recent latency compares with the tuning bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSignal {
    /// Mean latency above the high bound, tighten
    Overloaded,
    /// Mean latency below the low bound, loosen
    Idle,
    /// In between, or nothing measured
    Steady,
}

/// Trailing-interval latency sampler shared by all requests.
pub struct LatencySampler {
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    high: Duration,
    low: Duration,
    samples: Mutex<VecDeque<(u64, Duration)>>,
}

impl LatencySampler {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration, high: Duration, low: Duration) -> Self {
        Self {
            clock,
            interval_ms: interval.as_millis() as u64,
            high,
            low,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record how long one request took to handle.
    pub fn record(&self, elapsed: Duration) {
        let now = self.clock.now_ms();
        let mut samples = self.samples.lock();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back((now, elapsed));
    }

    /// Mean latency over the trailing interval, if anything was recorded.
    pub fn mean(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        let mut samples = self.samples.lock();
        if let Some(cutoff) = now.checked_sub(self.interval_ms) {
            while samples.front().is_some_and(|&(at, _)| at <= cutoff) {
                samples.pop_front();
            }
        }
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().map(|&(_, d)| d).sum();
        Some(total / samples.len() as u32)
    }

    pub fn signal(&self) -> LoadSignal {
        match self.mean() {
            Some(mean) if mean > self.high => LoadSignal::Overloaded,
            Some(mean) if mean < self.low => LoadSignal::Idle,
            _ => LoadSignal::Steady,
        }
    }
}
