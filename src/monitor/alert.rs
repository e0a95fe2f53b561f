//! Debounced, cooldown-gated alerting on probe results.
//!
//! Each target keeps the last [`SAMPLE_WINDOW`] latencies and a count of
//! consecutive probes whose window mean was over the target's threshold.
//! A slow probe that lifts the mean over the threshold only briefly does not
//! alert; a sustained run alerts once, then the target stays quiet for its
//! cooldown period. Breaches only start counting again once the cooldown is
//! over. Probe failures skip the window and alert straight away, subject to
//! the same cooldown.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error};

use crate::config::TargetConfig;

/// Number of latency samples averaged per target.
pub const SAMPLE_WINDOW: usize = 5;

/// Alerting parameters of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertRule {
    pub alert_threshold_ms: u64,
    pub min_alert_count: u32,
    pub cooldown_ms: u64,
}

impl From<&TargetConfig> for AlertRule {
    fn from(target: &TargetConfig) -> Self {
        Self {
            alert_threshold_ms: target.alert_threshold_ms,
            min_alert_count: target.min_alert_count,
            cooldown_ms: target.cooldown_ms,
        }
    }
}

/// What a probe reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe answered after this many milliseconds
    Latency(u64),
    /// The probe failed with this error
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertReason {
    /// The target could not be probed
    Down { error: String },
    /// The mean latency stayed over the threshold
    HighLatency { latency_ms: u64, mean_ms: f64 },
}

/// An alert ready to be emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub target: String,
    pub reason: AlertReason,
    /// Breach count when the alert fired
    pub consecutive_breaches: u32,
    pub timestamp_ms: u64,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            AlertReason::Down { error } => {
                write!(f, "{} is down: {}", self.target, error)
            }
            AlertReason::HighLatency {
                latency_ms,
                mean_ms,
            } => write!(
                f,
                "high response time ({}ms, mean {:.0}ms) for {} over {} consecutive checks",
                latency_ms, mean_ms, self.target, self.consecutive_breaches
            ),
        }
    }
}

/// Hysteresis state of one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertState {
    samples: VecDeque<u64>,
    consecutive_breaches: u32,
    last_alert_at: Option<u64>,
}

impl AlertState {
    pub fn consecutive_breaches(&self) -> u32 {
        self.consecutive_breaches
    }

    pub fn last_alert_at(&self) -> Option<u64> {
        self.last_alert_at
    }

    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    pub fn mean_latency(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
        }
    }

    fn in_cooldown(&self, rule: &AlertRule, now_ms: u64) -> bool {
        self.last_alert_at
            .is_some_and(|last| now_ms.saturating_sub(last) < rule.cooldown_ms)
    }

    /// Feed one probe result; returns the alert reason if one fires.
    pub fn observe(
        &mut self,
        rule: &AlertRule,
        outcome: ProbeOutcome,
        now_ms: u64,
    ) -> Option<AlertReason> {
        let reason = match outcome {
            ProbeOutcome::Failure(error) => AlertReason::Down { error },
            ProbeOutcome::Latency(latency_ms) => {
                if self.samples.len() == SAMPLE_WINDOW {
                    self.samples.pop_front();
                }
                self.samples.push_back(latency_ms);

                let mean_ms = self.mean_latency().unwrap_or(0.0);
                if mean_ms <= rule.alert_threshold_ms as f64 {
                    self.consecutive_breaches = 0;
                    return None;
                }
                if self.in_cooldown(rule, now_ms) {
                    return None;
                }
                self.consecutive_breaches += 1;
                if self.consecutive_breaches < rule.min_alert_count {
                    return None;
                }
                AlertReason::HighLatency {
                    latency_ms,
                    mean_ms,
                }
            }
        };

        if self.in_cooldown(rule, now_ms) {
            return None;
        }
        Some(reason)
    }

    fn mark_alerted(&mut self, now_ms: u64) {
        self.consecutive_breaches = 0;
        self.last_alert_at = Some(now_ms);
    }
}

/// Destination of fired alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Sink writing alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: &Alert) {
        error!(
            target_url = %alert.target,
            consecutive_breaches = alert.consecutive_breaches,
            "Alert: {}",
            alert
        );
    }
}

/// Alert hysteresis for every monitored target.
#[derive(Debug, Default)]
pub struct AlertEngine {
    states: DashMap<String, AlertState>,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a probe result for `target` and return the alert to emit, if any.
    pub fn observe(
        &self,
        target: &str,
        rule: &AlertRule,
        outcome: ProbeOutcome,
        now_ms: u64,
    ) -> Option<Alert> {
        let mut state = self.states.entry(target.to_string()).or_default();
        let reason = state.observe(rule, outcome, now_ms)?;

        let alert = Alert {
            target: target.to_string(),
            reason,
            consecutive_breaches: state.consecutive_breaches,
            timestamp_ms: now_ms,
        };
        state.mark_alerted(now_ms);

        debug!(target_url = %target, "Alert fired");
        Some(alert)
    }

    /// Snapshot of a target's state.
    pub fn state(&self, target: &str) -> Option<AlertState> {
        self.states.get(target).map(|s| s.clone())
    }

    /// Mean over the latency windows of all targets.
    pub fn mean_latency(&self) -> Option<f64> {
        let (sum, count) = self
            .states
            .iter()
            .flat_map(|entry| entry.samples().collect::<Vec<_>>())
            .fold((0u64, 0u64), |(sum, count), ms| (sum + ms, count + 1));
        (count > 0).then(|| sum as f64 / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "https://upstream.test";

    fn rule() -> AlertRule {
        AlertRule {
            alert_threshold_ms: 200,
            min_alert_count: 3,
            cooldown_ms: 60_000,
        }
    }

    fn feed(engine: &AlertEngine, latencies: &[u64], start_ms: u64, step_ms: u64) -> Vec<Alert> {
        latencies
            .iter()
            .enumerate()
            .filter_map(|(i, &ms)| {
                engine.observe(
                    TARGET,
                    &rule(),
                    ProbeOutcome::Latency(ms),
                    start_ms + i as u64 * step_ms,
                )
            })
            .collect()
    }

    #[test]
    fn test_sustained_breach_alerts_once() {
        let engine = AlertEngine::new();
        let alerts = feed(&engine, &[250, 260, 240, 255, 245], 0, 5_000);

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].timestamp_ms, 10_000);
        assert_eq!(alerts[0].consecutive_breaches, 3);
        assert!(matches!(
            alerts[0].reason,
            AlertReason::HighLatency { latency_ms: 240, .. }
        ));

        // the two slow probes after the alert fall inside the cooldown
        let state = engine.state(TARGET).unwrap();
        assert_eq!(state.consecutive_breaches(), 0);
        assert_eq!(state.last_alert_at(), Some(10_000));
    }

    #[test]
    fn test_cooldown_silences_continuing_breaches() {
        let engine = AlertEngine::new();
        // 20 probes 5s apart, all slow: one alert at t=10s, then breaches
        // count again from t=70s and the next alert needs three fresh ones.
        let alerts = feed(&engine, &[300; 20], 0, 5_000);
        let fired: Vec<_> = alerts
            .iter()
            .map(|a| (a.timestamp_ms, a.consecutive_breaches))
            .collect();
        assert_eq!(fired, vec![(10_000, 3), (80_000, 3)]);
    }

    #[test]
    fn test_brief_spike_does_not_alert() {
        let engine = AlertEngine::new();
        // means: 50, 225, 166, 137, 120
        let alerts = feed(&engine, &[50, 400, 50, 50, 50], 0, 5_000);
        assert!(alerts.is_empty());
        assert_eq!(engine.state(TARGET).unwrap().consecutive_breaches(), 0);
    }

    #[test]
    fn test_breaches_frozen_during_cooldown() {
        let engine = AlertEngine::new();
        feed(&engine, &[300, 300, 300], 0, 1_000);

        feed(&engine, &[300, 300, 300, 300], 3_000, 1_000);
        let state = engine.state(TARGET).unwrap();
        assert_eq!(state.consecutive_breaches(), 0);
        // samples are still recorded
        assert_eq!(state.samples().count(), SAMPLE_WINDOW);
    }

    #[test]
    fn test_recovery_resets_breaches() {
        let engine = AlertEngine::new();
        feed(&engine, &[300, 300], 0, 1);
        assert_eq!(engine.state(TARGET).unwrap().consecutive_breaches(), 2);

        // Pull the mean back under the threshold
        feed(&engine, &[10, 10, 10], 10, 1);
        assert_eq!(engine.state(TARGET).unwrap().consecutive_breaches(), 0);
    }

    #[test]
    fn test_window_keeps_last_five_samples() {
        let engine = AlertEngine::new();
        feed(&engine, &[1, 2, 3, 4, 5, 6, 7], 0, 1);
        let samples: Vec<_> = engine.state(TARGET).unwrap().samples().collect();
        assert_eq!(samples, vec![3, 4, 5, 6, 7]);
        assert_eq!(engine.mean_latency(), Some(5.0));
    }

    #[test]
    fn test_failure_alerts_immediately_with_cooldown() {
        let engine = AlertEngine::new();
        let down = || ProbeOutcome::Failure("connection refused".into());

        let alert = engine.observe(TARGET, &rule(), down(), 1_000).unwrap();
        assert_eq!(
            alert.reason,
            AlertReason::Down {
                error: "connection refused".into()
            }
        );
        assert_eq!(alert.to_string(), "https://upstream.test is down: connection refused");

        assert!(engine.observe(TARGET, &rule(), down(), 30_000).is_none());
        assert!(engine.observe(TARGET, &rule(), down(), 61_000).is_some());
    }

    #[test]
    fn test_failure_does_not_touch_latency_window() {
        let engine = AlertEngine::new();
        feed(&engine, &[300, 300], 0, 1);
        engine.observe(TARGET, &rule(), ProbeOutcome::Failure("timeout".into()), 10);

        let state = engine.state(TARGET).unwrap();
        assert_eq!(state.samples().count(), 2);
        // firing resets the breach run
        assert_eq!(state.consecutive_breaches(), 0);
    }

    #[test]
    fn test_cooldown_applies_across_alert_kinds() {
        let engine = AlertEngine::new();
        engine
            .observe(TARGET, &rule(), ProbeOutcome::Failure("timeout".into()), 0)
            .unwrap();

        let alerts = feed(&engine, &[500, 500, 500, 500], 1_000, 1_000);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_targets_are_independent() {
        let engine = AlertEngine::new();
        let rule = rule();
        for t in 0..3 {
            engine.observe("a", &rule, ProbeOutcome::Latency(500), t);
            engine.observe("b", &rule, ProbeOutcome::Latency(10), t);
        }
        assert_eq!(engine.state("a").unwrap().last_alert_at(), Some(2));
        assert_eq!(engine.state("b").unwrap().last_alert_at(), None);
    }
}
