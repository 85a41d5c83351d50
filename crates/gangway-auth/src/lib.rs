//! gangway-auth — request authentication for the Gangway dispatcher.
//!
//! Two credential shapes are accepted per request, selected by inspecting
//! the gRPC metadata:
//!
//! 1. a `jwt` entry: an OIDC token bound to a repository, checked against
//!    the team-ownership service;
//! 2. otherwise `authorization`/`timestamp`/`team` entries: an
//!    HMAC-SHA256 signature over the timestamp with a team API key.

pub mod authenticator;
pub mod error;
pub mod signature;
pub mod teams;
pub mod token;

pub use authenticator::Authenticator;
pub use error::{AuthError, AuthResult};
pub use teams::{RepositoryAuthorizer, TeamsClient};
pub use token::TokenValidator;
