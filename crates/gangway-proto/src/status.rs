//! Canonical status constructors.
//!
//! Every status row in the system is produced through one of these, so the
//! human-readable messages stay consistent between the dispatcher, the
//! agent, and what the CI client prints.

use std::fmt::Display;

use crate::proto::{DeploymentRequest, DeploymentState, DeploymentStatus};
use crate::time;

impl DeploymentStatus {
    fn new(request: &DeploymentRequest, state: DeploymentState, message: String) -> Self {
        DeploymentStatus {
            request: Some(request.clone()),
            time: Some(time::now()),
            state: state as i32,
            message,
        }
    }

    pub fn queued(request: &DeploymentRequest) -> Self {
        Self::new(
            request,
            DeploymentState::Queued,
            "Deployment request has been put on the queue for further processing.".to_string(),
        )
    }

    pub fn in_progress(request: &DeploymentRequest, message: impl Into<String>) -> Self {
        Self::new(request, DeploymentState::InProgress, message.into())
    }

    pub fn success(request: &DeploymentRequest) -> Self {
        Self::new(
            request,
            DeploymentState::Success,
            "Deployment completed successfully.".to_string(),
        )
    }

    pub fn failure(request: &DeploymentRequest, err: impl Display) -> Self {
        Self::new(request, DeploymentState::Failure, err.to_string())
    }

    pub fn error(request: &DeploymentRequest, err: impl Display) -> Self {
        Self::new(request, DeploymentState::Error, err.to_string())
    }

    /// Emitted on behalf of an agent that has no record of the deployment.
    pub fn inactive(request: &DeploymentRequest) -> Self {
        Self::new(
            request,
            DeploymentState::Inactive,
            "Deployment has been lost.".to_string(),
        )
    }

    /// Correlation ID of the request this status belongs to.
    pub fn request_id(&self) -> &str {
        self.request.as_ref().map(|r| r.id.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            id: "f00dcafe-0000-0000-0000-000000000000".to_string(),
            cluster: "dev".to_string(),
            team: "aura".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn queued_status_carries_request() {
        let status = DeploymentStatus::queued(&request());
        assert_eq!(status.state(), DeploymentState::Queued);
        assert_eq!(status.request_id(), "f00dcafe-0000-0000-0000-000000000000");
        assert!(status.time.is_some());
    }

    #[test]
    fn success_message_is_canonical() {
        let status = DeploymentStatus::success(&request());
        assert_eq!(status.message, "Deployment completed successfully.");
    }

    #[test]
    fn failure_preserves_error_text() {
        let status = DeploymentStatus::failure(&request(), "resource 2: boom");
        assert_eq!(status.state(), DeploymentState::Failure);
        assert_eq!(status.message, "resource 2: boom");
    }
}
