//! Domain types for the Gangway state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One admitted deployment request.
///
/// `state` caches the latest status so listing and historic queries need
/// no join against the status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub team: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
    pub state: Option<String>,
}

/// One entry in a deployment's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatusRow {
    pub id: String,
    pub deployment_id: String,
    pub state: String,
    pub message: String,
    pub created: DateTime<Utc>,
}

/// Denormalized identifier of one resource in a request. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentResourceRow {
    pub id: String,
    pub deployment_id: String,
    pub index: u32,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// A per-team credential, decrypted on fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub team: String,
    pub group_id: String,
    pub key: Vec<u8>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl ApiKey {
    /// A key validates requests only until its expiry.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// On-disk form of an API key; `key` is hex-encoded AES-GCM ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredApiKey {
    pub team: String,
    pub group_id: String,
    pub key: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}
