//! Upstream site monitoring and alerting.

mod alert;
mod probe;
mod site;

pub use alert::{
    Alert, AlertEngine, AlertReason, AlertRule, AlertSink, AlertState, LogAlertSink,
    ProbeOutcome, SAMPLE_WINDOW,
};
pub use probe::{HttpProber, ProbeError, ProbeResponse, Prober};
pub use site::{EndpointStats, MonitorMetrics, MonitorSnapshot, SiteMonitor};
