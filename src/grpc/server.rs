//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::enforcement_server::EnforcementServer;
use super::service::EnforcementService;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::AdaptiveLimiter;

/// gRPC server for the enforcement service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<AdaptiveLimiter>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, limiter: Arc<AdaptiveLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = EnforcementService::new(self.limiter);

        info!(addr = %self.addr, "Starting gRPC server for Enforcement");

        Server::builder()
            .add_service(EnforcementServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                FloodgateError::Grpc(e)
            })
    }
}
