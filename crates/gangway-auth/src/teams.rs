//! Team-ownership lookups.
//!
//! A repository OIDC credential is only as good as the team's claim to the
//! repository; the upstream team service is the source of truth for that
//! relationship.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AuthError, AuthResult};

/// Answers "may this team deploy this repository?".
#[async_trait]
pub trait RepositoryAuthorizer: Send + Sync {
    async fn is_authorized(&self, team: &str, repository: &str) -> AuthResult<bool>;
}

/// HTTP client for the upstream team-ownership service.
pub struct TeamsClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AuthorizedResponse {
    authorized: bool,
}

impl TeamsClient {
    pub fn new(base_url: &str) -> Self {
        TeamsClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RepositoryAuthorizer for TeamsClient {
    async fn is_authorized(&self, team: &str, repository: &str) -> AuthResult<bool> {
        let response = self
            .http
            .get(format!("{}/authorized", self.base_url))
            .query(&[("team", team), ("repository", repository)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::Unavailable(format!("query team service: {e}")))?;

        let body: AuthorizedResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("decode team service response: {e}")))?;

        Ok(body.authorized)
    }
}
