//! Authentication failures and their gRPC status mapping.

use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

/// Why a request was not authenticated.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials missing or malformed.
    #[error("{0}")]
    Unauthenticated(String),

    /// Credentials well-formed but not authorized for this team/repo.
    #[error("{0}")]
    PermissionDenied(String),

    /// Malformed request metadata.
    #[error("{0}")]
    InvalidArgument(String),

    /// Signature timestamp outside the permitted skew window.
    #[error("{0}")]
    DeadlineExceeded(String),

    /// A backing service (key store, JWKS, ownership service) is down.
    #[error("{0}")]
    Unavailable(String),
}

impl From<AuthError> for tonic::Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(msg) => tonic::Status::unauthenticated(msg),
            AuthError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            AuthError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            AuthError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            AuthError::Unavailable(msg) => tonic::Status::unavailable(msg),
        }
    }
}
