//! Adaptive rate limiting and blocking.

mod blocklist;
mod estimator;
mod key;
mod latency;
mod limiter;
mod window;

pub use blocklist::{AttemptRecord, BlockRegistry};
pub use estimator::FrequencyEstimator;
pub use key::{ClientKey, RequestMeta};
pub use latency::{LatencySampler, LoadSignal};
pub use limiter::{AdaptiveLimiter, Decision, Outcome, REJECT_STATUS};
pub use window::{ThresholdPolicy, WindowVerdict, WindowedCounter};
