//! Floodgate - Adaptive Rate Limiting and Upstream Alerting
//!
//! This crate implements a two-tier rate limiter for request admission: a
//! count-min sketch lets ordinary clients through without touching shared
//! state, and only clients whose estimated rate looks suspicious are counted
//! exactly in a sliding window with a load-adaptive threshold. Clients that
//! exceed their window are blocked. Alongside it, a site monitor probes
//! upstream services and raises debounced latency and outage alerts.

pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod monitor;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
