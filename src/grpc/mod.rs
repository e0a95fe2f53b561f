//! gRPC enforcement surface.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::{EnforcementService, DEFAULT_RECENT_LIMIT};

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("floodgate.v1");
}

pub use proto::{
    enforcement_server::EnforcementServer, CheckRequest, CheckResponse, LatencyReport,
    RecentBlockedRequest, RecentBlockedResponse,
};
