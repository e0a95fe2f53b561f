//! Enforcement service implementation.

use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::{
    enforcement_server::Enforcement, BlockedAttempt, CheckRequest, CheckResponse, LatencyAck,
    LatencyReport, RecentBlockedRequest, RecentBlockedResponse,
};
use crate::ratelimit::{AdaptiveLimiter, AttemptRecord, ClientKey, RequestMeta};

/// Attempts returned by `RecentBlocked` when the caller sets no limit.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// gRPC front of the adaptive limiter.
pub struct EnforcementService {
    limiter: Arc<AdaptiveLimiter>,
}

impl EnforcementService {
    pub fn new(limiter: Arc<AdaptiveLimiter>) -> Self {
        Self { limiter }
    }
}

impl From<CheckRequest> for RequestMeta {
    fn from(req: CheckRequest) -> Self {
        let mut meta = RequestMeta::new(ClientKey::new(req.client), &req.method, &req.path);
        for (name, value) in &req.headers {
            meta = meta.with_header(name, value);
        }
        meta
    }
}

impl From<AttemptRecord> for BlockedAttempt {
    fn from(record: AttemptRecord) -> Self {
        Self {
            id: record.id.to_string(),
            timestamp_ms: record.timestamp_ms(),
            client: record.client.to_string(),
            method: record.method,
            path: record.path,
            headers: record.headers.into_iter().collect(),
        }
    }
}

#[tonic::async_trait]
impl Enforcement for EnforcementService {
    /// Decide whether a request may reach the application.
    #[instrument(
        skip(self, request),
        fields(
            client = %request.get_ref().client,
            method = %request.get_ref().method,
            path = %request.get_ref().path
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        if req.client.is_empty() {
            warn!("Received check request with empty client");
            return Err(Status::invalid_argument("client is required"));
        }

        let meta = RequestMeta::from(req);
        let decision = self.limiter.check(&meta).await;

        Ok(Response::new(CheckResponse {
            allowed: decision.allowed(),
            status_code: u32::from(decision.status_code()),
            body: decision.error_body().unwrap_or_default(),
            reason: decision.outcome.as_str().to_string(),
        }))
    }

    async fn report_latency(
        &self,
        request: Request<LatencyReport>,
    ) -> Result<Response<LatencyAck>, Status> {
        let elapsed = Duration::from_micros(request.into_inner().duration_micros);
        self.limiter.record_latency(elapsed);
        Ok(Response::new(LatencyAck {}))
    }

    #[instrument(skip(self, request), fields(limit = request.get_ref().limit))]
    async fn recent_blocked(
        &self,
        request: Request<RecentBlockedRequest>,
    ) -> Result<Response<RecentBlockedResponse>, Status> {
        let limit = match request.into_inner().limit {
            0 => DEFAULT_RECENT_LIMIT,
            n => n as usize,
        };

        let attempts = self
            .limiter
            .blocklist()
            .recent_attempts(limit)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to read blocked attempts");
                Status::unavailable(e.to_string())
            })?;

        debug!(count = attempts.len(), "Listing blocked attempts");

        Ok(Response::new(RecentBlockedResponse {
            attempts: attempts.into_iter().map(BlockedAttempt::from).collect(),
        }))
    }
}
