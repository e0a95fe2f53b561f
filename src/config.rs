//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Prefix for environment variable overrides, e.g. `FLOODGATE__SERVER__GRPC_ADDR`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Key-value backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Upstream health monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// How often expired store entries are swept, in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_maintenance_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Base threshold used when a client has no adjusted threshold yet
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Lower bound for adaptive thresholds
    #[serde(default = "default_min_threshold")]
    pub min_threshold: u64,

    /// Upper bound for adaptive thresholds
    #[serde(default = "default_max_threshold")]
    pub max_threshold: u64,

    /// Estimated request count above which a client goes through exact counting
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: u64,

    /// Count-min sketch error factor
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Count-min sketch failure probability
    #[serde(default = "default_delta")]
    pub delta: f64,

    /// Mean handler latency above which thresholds are tightened
    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: u64,

    /// Mean handler latency below which thresholds are loosened
    #[serde(default = "default_low_latency_ms")]
    pub low_latency_ms: u64,

    /// Interval over which handler latencies are averaged
    #[serde(default = "default_latency_sample_interval_ms")]
    pub latency_sample_interval_ms: u64,

    /// How long blocked-attempt records are kept
    #[serde(default = "default_attempt_retention")]
    pub attempt_retention_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            suspicious_threshold: default_suspicious_threshold(),
            epsilon: default_epsilon(),
            delta: default_delta(),
            high_latency_ms: default_high_latency_ms(),
            low_latency_ms: default_low_latency_ms(),
            latency_sample_interval_ms: default_latency_sample_interval_ms(),
            attempt_retention_secs: default_attempt_retention(),
        }
    }
}

impl RateLimitingConfig {
    /// Retention horizon for blocked-attempt records.
    pub fn attempt_retention(&self) -> Duration {
        Duration::from_secs(self.attempt_retention_secs)
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    100
}

fn default_min_threshold() -> u64 {
    10
}

fn default_max_threshold() -> u64 {
    1000
}

fn default_suspicious_threshold() -> u64 {
    50
}

fn default_epsilon() -> f64 {
    0.001
}

fn default_delta() -> f64 {
    0.99
}

fn default_high_latency_ms() -> u64 {
    100
}

fn default_low_latency_ms() -> u64 {
    50
}

fn default_latency_sample_interval_ms() -> u64 {
    10_000
}

fn default_attempt_retention() -> u64 {
    3600
}

/// Key-value backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL. When unset the in-process backend is used.
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Upstream health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Delay between two probes of the same target
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Timeout of a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Targets to probe
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            targets: Vec::new(),
        }
    }
}

impl MonitoringConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

/// A monitored upstream site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the site, also used as the target identity
    pub url: String,

    /// Path appended to the URL when probing
    #[serde(default = "default_target_path")]
    pub path: String,

    /// Mean latency above which a sample counts as a breach
    pub alert_threshold_ms: u64,

    /// Consecutive breaches required before alerting
    #[serde(default = "default_min_alert_count")]
    pub min_alert_count: u32,

    /// Minimum time between two alerts for this target
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl TargetConfig {
    /// Full URL probed for this target.
    pub fn probe_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.path)
    }
}

fn default_target_path() -> String {
    "/".to_string()
}

fn default_min_alert_count() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    300_000
}

impl FloodgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.window_ms == 0 {
            return Err(FloodgateError::Config("window_ms must be positive".into()));
        }
        if rl.min_threshold == 0 || rl.min_threshold > rl.max_threshold {
            return Err(FloodgateError::Config(format!(
                "threshold bounds are invalid: min={} max={}",
                rl.min_threshold, rl.max_threshold
            )));
        }
        if !(0.0..1.0).contains(&rl.epsilon) || rl.epsilon == 0.0 {
            return Err(FloodgateError::Config(format!(
                "epsilon must be in (0, 1), got {}",
                rl.epsilon
            )));
        }
        if !(0.0..1.0).contains(&rl.delta) || rl.delta == 0.0 {
            return Err(FloodgateError::Config(format!(
                "delta must be in (0, 1), got {}",
                rl.delta
            )));
        }
        if rl.low_latency_ms > rl.high_latency_ms {
            return Err(FloodgateError::Config(
                "low_latency_ms must not exceed high_latency_ms".into(),
            ));
        }
        for target in &self.monitoring.targets {
            if target.url.is_empty() {
                return Err(FloodgateError::Config("monitoring target without url".into()));
            }
        }
        Ok(())
    }
}
