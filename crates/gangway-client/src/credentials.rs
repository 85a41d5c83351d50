//! Request signing.
//!
//! API-key credentials sign the current timestamp per RPC; token
//! credentials ride along as-is. The dispatcher picks its validation
//! path from the metadata keys (`jwt` first, HMAC otherwise).

use chrono::{SecondsFormat, Utc};

use gangway_auth::signature;

use crate::config::Config;
use crate::error::{ClientError, ExitCode};

#[derive(Clone)]
pub enum Credentials {
    ApiKey(Vec<u8>),
    GithubToken(String),
}

impl Config {
    pub fn credentials(&self) -> Result<Credentials, ClientError> {
        if let Some(token) = &self.github_token {
            return Ok(Credentials::GithubToken(token.clone()));
        }
        let key = self.api_key.as_ref().ok_or_else(|| {
            ClientError::new(ExitCode::InvocationFailure, crate::config::AUTH_REQUIRED_MSG)
        })?;
        let key = hex::decode(key).map_err(|_| {
            ClientError::new(
                ExitCode::InvocationFailure,
                crate::config::MALFORMED_API_KEY_MSG,
            )
        })?;
        Ok(Credentials::ApiKey(key))
    }
}

impl Credentials {
    /// Attach authentication metadata to an outbound request.
    pub fn attach<T>(
        &self,
        request: &mut tonic::Request<T>,
        team: &str,
    ) -> Result<(), ClientError> {
        let metadata = request.metadata_mut();
        let invalid =
            |e: &dyn std::fmt::Display| ClientError::new(ExitCode::InternalError, e.to_string());

        match self {
            Credentials::GithubToken(token) => {
                metadata.insert("jwt", token.parse().map_err(|e| invalid(&e))?);
            }
            Credentials::ApiKey(key) => {
                let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
                let tag = signature::sign(timestamp.as_bytes(), key);
                metadata.insert(
                    "authorization",
                    hex::encode(tag).parse().map_err(|e| invalid(&e))?,
                );
                metadata.insert("timestamp", timestamp.parse().map_err(|e| invalid(&e))?);
            }
        }
        metadata.insert("team", team.parse().map_err(|e| invalid(&e))?);
        Ok(())
    }
}
