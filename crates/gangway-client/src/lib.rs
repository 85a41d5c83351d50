//! gangway-client — the CI side of the deployment pipeline.
//!
//! Minimal surface a pipeline consumes: prepare a request from
//! configuration and resource documents, send it, optionally wait for
//! the terminal status, and turn the outcome into a process exit code.

pub mod config;
pub mod credentials;
pub mod deployer;
pub mod error;

pub use config::Config;
pub use credentials::Credentials;
pub use deployer::Deployer;
pub use error::{ClientError, ExitCode};
