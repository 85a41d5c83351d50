//! gangway-agent — the per-cluster worker of the deployment pipeline.
//!
//! The agent holds a single long-lived stream to the dispatcher, runs one
//! driver task per inbound deployment request, and reports every status
//! transition back:
//!
//! ```text
//! dispatcher ──Deployments──▶ transport ──▶ runner ──▶ apply engine ──▶ kube API
//! dispatcher ◀─ReportStatus── streamer ◀── watchers ◀─────────────────┘
//! ```
//!
//! Kubernetes access goes through the dynamic REST client in [`kube`]:
//! resources are applied under team impersonation so cluster RBAC, not
//! the agent, enforces the team boundary.

pub mod kube;
pub mod operation;
pub mod runner;
pub mod transport;
pub mod watch;

pub use kube::client::{KubeClient, KubeConfig};
pub use operation::Operation;
pub use runner::RunnerConfig;
pub use transport::{Agent, AgentConfig};

/// Annotation carrying the request's correlation ID on every applied
/// resource; rollout watchers use it to tell their own deployment apart
/// from a later one.
pub const CORRELATION_ANNOTATION: &str = "nais.io/deploymentCorrelationID";
