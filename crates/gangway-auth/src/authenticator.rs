//! The credential chain: JWT first, HMAC fallback.
//!
//! The shape is chosen by inspecting metadata keys; a request carrying a
//! `jwt` entry is never considered for HMAC validation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tonic::metadata::MetadataMap;
use tracing::{debug, info};

use gangway_store::StateStore;

use crate::error::{AuthError, AuthResult};
use crate::signature;
use crate::teams::RepositoryAuthorizer;
use crate::token::TokenValidator;

struct HmacCredentials {
    tag: Vec<u8>,
    timestamp: String,
    team: String,
}

/// Authenticates inbound dispatcher requests and resolves the team.
pub struct Authenticator {
    store: StateStore,
    token_validator: Option<TokenValidator>,
    authorizer: Option<Arc<dyn RepositoryAuthorizer>>,
}

impl Authenticator {
    pub fn new(
        store: StateStore,
        token_validator: Option<TokenValidator>,
        authorizer: Option<Arc<dyn RepositoryAuthorizer>>,
    ) -> Self {
        Authenticator {
            store,
            token_validator,
            authorizer,
        }
    }

    /// Validate the request credentials and return the authorized team.
    pub async fn authenticate(&self, metadata: &MetadataMap) -> AuthResult<String> {
        match get(metadata, "jwt") {
            Some(token) => self.authenticate_token(metadata, &token).await,
            None => self.authenticate_signature(metadata).await,
        }
    }

    async fn authenticate_token(&self, metadata: &MetadataMap, token: &str) -> AuthResult<String> {
        let validator = self.token_validator.as_ref().ok_or_else(|| {
            AuthError::Unauthenticated("token authentication is not enabled".to_string())
        })?;

        let claims = validator.validate(token).await?;
        let repository = claims.repository.ok_or_else(|| {
            AuthError::InvalidArgument("missing repository in JWT token".to_string())
        })?;

        let team = get(metadata, "team")
            .ok_or_else(|| AuthError::InvalidArgument("missing team in metadata".to_string()))?;

        let authorizer = self.authorizer.as_ref().ok_or_else(|| {
            AuthError::Unavailable("team-ownership service is not configured".to_string())
        })?;
        if !authorizer.is_authorized(&team, &repository).await? {
            return Err(AuthError::PermissionDenied(format!(
                "repo {repository:?} not authorized by team {team:?}"
            )));
        }

        debug!(%team, %repository, "authenticated via repository token");
        Ok(team)
    }

    async fn authenticate_signature(&self, metadata: &MetadataMap) -> AuthResult<String> {
        let credentials = extract_hmac_credentials(metadata)?;

        let signed_at = parse_rfc3339(&credentials.timestamp)?;
        if !signature::within_time_range(signed_at, Utc::now()) {
            return Err(AuthError::DeadlineExceeded("signature expired".to_string()));
        }

        let api_keys = self.store.api_keys(&credentials.team).map_err(|e| {
            info!(team = %credentials.team, error = %e, "fetching API keys failed");
            if e.is_not_found() {
                AuthError::Unauthenticated("failed authentication".to_string())
            } else {
                AuthError::Unavailable(
                    "something wrong happened when communicating with the api key store"
                        .to_string(),
                )
            }
        })?;

        let now = Utc::now();
        let valid_keys: Vec<&[u8]> = api_keys
            .iter()
            .filter(|k| k.is_valid(now))
            .map(|k| k.key.as_slice())
            .collect();

        if !signature::validate_any(
            credentials.timestamp.as_bytes(),
            &credentials.tag,
            valid_keys,
        ) {
            info!(team = %credentials.team, "HMAC signature did not verify");
            return Err(AuthError::PermissionDenied("failed authentication".to_string()));
        }

        debug!(team = %credentials.team, "authenticated via API key signature");
        Ok(credentials.team)
    }
}

fn get(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_rfc3339(s: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuthError::InvalidArgument(format!("malformed signature timestamp: {e}")))
}

fn extract_hmac_credentials(metadata: &MetadataMap) -> AuthResult<HmacCredentials> {
    let tag = get(metadata, "authorization")
        .ok_or_else(|| AuthError::Unauthenticated("request is not signed with API key".to_string()))?;
    let timestamp = get(metadata, "timestamp").ok_or_else(|| {
        AuthError::Unauthenticated("API key signature timestamp is not provided".to_string())
    })?;
    let team = get(metadata, "team").ok_or_else(|| {
        AuthError::Unauthenticated("team is not provided in API key signature metadata".to_string())
    })?;

    let tag = hex::decode(&tag)
        .map_err(|_| AuthError::InvalidArgument("wrong API key signature format".to_string()))?;

    Ok(HmacCredentials {
        tag,
        timestamp,
        team,
    })
}
