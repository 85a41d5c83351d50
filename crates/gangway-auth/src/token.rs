//! OIDC token validation.
//!
//! Tokens are verified against the identity provider's JWKS, which is
//! cached in-process and refreshed hourly (or eagerly when an unknown key
//! id appears). Issuer and audience are enforced with a 5 second leeway.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AuthError, AuthResult};

const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LEEWAY_SECONDS: u64 = 5;

/// Claims Gangway cares about; everything else is validated structurally.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// `owner/name` of the repository the workflow runs for.
    pub repository: Option<String>,
    #[serde(default)]
    pub sub: String,
}

enum KeySource {
    /// Keys fetched from a JWKS endpoint, by key id.
    Jwks {
        url: String,
        http: reqwest::Client,
        cache: RwLock<JwksCache>,
    },
    /// A single fixed key (tests and pre-shared setups).
    Static(Box<DecodingKey>),
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Validates OIDC tokens issued to CI workflows.
pub struct TokenValidator {
    source: KeySource,
    algorithm: Algorithm,
    issuer: String,
    audience: String,
}

impl TokenValidator {
    pub fn new(jwks_url: &str, issuer: &str, audience: &str) -> Self {
        TokenValidator {
            source: KeySource::Jwks {
                url: jwks_url.to_string(),
                http: reqwest::Client::new(),
                cache: RwLock::new(JwksCache {
                    keys: HashMap::new(),
                    fetched_at: None,
                }),
            },
            algorithm: Algorithm::RS256,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Validator with a fixed decoding key instead of a JWKS endpoint.
    pub fn with_static_key(
        key: DecodingKey,
        algorithm: Algorithm,
        issuer: &str,
        audience: &str,
    ) -> Self {
        TokenValidator {
            source: KeySource::Static(Box::new(key)),
            algorithm,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Verify signature, issuer, audience, and expiry; return the claims.
    pub async fn validate(&self, token: &str) -> AuthResult<TokenClaims> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = LEEWAY_SECONDS;

        let result = match &self.source {
            KeySource::Static(key) => decode::<TokenClaims>(token, key, &validation),
            KeySource::Jwks { .. } => {
                let header = decode_header(token)
                    .map_err(|e| AuthError::Unauthenticated(format!("malformed token: {e}")))?;
                let kid = header.kid.ok_or_else(|| {
                    AuthError::Unauthenticated("token has no key id".to_string())
                })?;
                let key = self.decoding_key(&kid).await?;
                decode::<TokenClaims>(token, &key, &validation)
            }
        };

        result.map(|data| data.claims).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    AuthError::Unauthenticated("authentication token has expired".to_string())
                }
                _ => AuthError::Unauthenticated(e.to_string()),
            }
        })
    }

    /// Key for `kid`, refreshing the JWKS when stale or unknown.
    async fn decoding_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        let KeySource::Jwks { url, http, cache } = &self.source else {
            unreachable!("decoding_key is only called for the JWKS source");
        };

        {
            let cache = cache.read().await;
            let fresh = cache
                .fetched_at
                .is_some_and(|at| at.elapsed() < JWKS_REFRESH_INTERVAL);
            if fresh {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        let mut cache = cache.write().await;
        let jwks: jsonwebtoken::jwk::JwkSet = http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::Unavailable(format!("fetch JWKS: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("decode JWKS: {e}")))?;

        cache.keys.clear();
        for jwk in &jwks.keys {
            let Some(id) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    cache.keys.insert(id, key);
                }
                Err(e) => debug!(kid = %id, error = %e, "skipping unusable JWK"),
            }
        }
        cache.fetched_at = Some(Instant::now());

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::Unauthenticated(format!("unknown signing key {kid}")))
    }
}
