//! Upstream health probes.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::{FloodgateError, Result};

/// A probe that got an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub latency: Duration,
}

/// Why a probe failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Answered, but not with a success status
    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(String),
}

impl ProbeError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProbeError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Issues one probe against a URL.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> std::result::Result<ProbeResponse, ProbeError>;
}

/// HTTP GET prober. Any non-2xx answer counts as a failure.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FloodgateError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> std::result::Result<ProbeResponse, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;
        let latency = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(ProbeResponse {
            status_code: status.as_u16(),
            latency,
        })
    }
}
