//! Exit-code taxonomy.
//!
//! The exit code is part of the CI contract; the numeric values are
//! load-bearing and must not shift.

use gangway_proto::{DeploymentState, DeploymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    DeploymentFailure = 1,
    DeploymentError = 2,
    DeploymentInactive = 3,
    NoDeployment = 4,
    Unavailable = 5,
    InvocationFailure = 6,
    InternalError = 7,
    TemplateError = 8,
    Timeout = 9,
}

/// A failed client run, carrying the exit code the process should
/// terminate with.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub code: ExitCode,
    pub message: String,
}

impl ClientError {
    pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
        ClientError {
            code,
            message: message.into(),
        }
    }
}

/// Exit code for the overall outcome of a run.
pub fn exit_code(result: &Result<(), ClientError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::Success,
        Err(e) => e.code,
    }
}

/// Map a terminal status onto the contract; non-error terminals are Ok.
pub fn status_error(status: &DeploymentStatus) -> Result<(), ClientError> {
    match status.state() {
        DeploymentState::Error => Err(ClientError::new(
            ExitCode::DeploymentError,
            "deployment system encountered an error",
        )),
        DeploymentState::Failure => Err(ClientError::new(
            ExitCode::DeploymentFailure,
            "deployment failed",
        )),
        DeploymentState::Inactive => Err(ClientError::new(
            ExitCode::DeploymentInactive,
            "deployment has been stopped",
        )),
        _ => Ok(()),
    }
}

/// `unavailable` and `internal` are worth retrying; everything else is a
/// verdict.
pub fn retriable(code: tonic::Code) -> bool {
    matches!(code, tonic::Code::Unavailable | tonic::Code::Internal)
}

pub fn format_grpc_error(status: &tonic::Status) -> String {
    format!("{:?}: {}", status.code(), status.message())
}
