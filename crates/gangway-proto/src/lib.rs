//! gangway-proto — wire protocol for the Gangway deployment pipeline.
//!
//! Defines the gRPC surface between the three parties:
//!
//! ```text
//! CI client ──Deploy/Status──▶ dispatcher ──Deployments/ReportStatus──▶ agent
//! ```
//!
//! The generated protobuf types live in [`proto`]; the sibling modules add
//! the small amount of behavior the rest of the workspace hangs off them:
//! state classification, canonical status constructors, timestamp
//! conversion, and resource payload decoding.

pub mod payload;
pub mod state;
pub mod status;
pub mod time;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("gangway");
}

pub use payload::{PayloadError, ResourceId};
pub use proto::{
    AgentConnectOpts, DeploymentRequest, DeploymentState, DeploymentStatus, Kubernetes,
    Repository, ReportStatusAck,
};
