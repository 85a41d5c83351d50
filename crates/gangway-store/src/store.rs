//! StateStore — redb-backed persistence for the Gangway dispatcher.
//!
//! Provides typed CRUD operations over deployments, status history,
//! resource identifiers, and API keys. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;
use uuid::Uuid;

use crate::crypto::{self, EncryptionKey};
use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Validity of a freshly rotated API key.
const APIKEY_LIFETIME_DAYS: i64 = 365 * 5;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// End bound for a `{parent}/` prefix range scan. `'0'` is the first
/// ASCII character after `'/'`, so this covers exactly the child keys.
fn prefix_bounds(parent: &str) -> (String, String) {
    (format!("{parent}/"), format!("{parent}0"))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    encryption_key: EncryptionKey,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path, encryption_key: EncryptionKey) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            encryption_key,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory(encryption_key: EncryptionKey) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            encryption_key,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(STATUSES).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(APIKEYS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn write_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %deployment.id, "deployment stored");
        Ok(())
    }

    /// Get a deployment by ID.
    pub fn deployment(&self, id: &str) -> StoreResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List deployments, newest first. An empty team matches all teams.
    pub fn deployments(&self, team: &str, limit: usize) -> StoreResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if team.is_empty() || deployment.team == team {
                results.push(deployment);
            }
        }
        results.sort_by(|a, b| b.created.cmp(&a.created));
        results.truncate(limit);
        Ok(results)
    }

    /// Deployments for a cluster that were still open before `cutoff`.
    ///
    /// Used when an agent reconnects: anything queued or in progress from
    /// before the agent's startup has been lost and must be invalidated.
    pub fn historic_deployments(
        &self,
        cluster: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let open = matches!(deployment.state.as_deref(), Some("queued") | Some("in_progress"));
            if deployment.cluster == cluster && deployment.created < cutoff && open {
                results.push(deployment);
            }
        }
        Ok(results)
    }

    // ── Status history ─────────────────────────────────────────────

    /// Append a status row.
    ///
    /// Fails with [`StoreError::ForeignKey`] if the referenced deployment
    /// does not exist. The deployment's cached `state` is updated in the
    /// same transaction.
    pub fn write_status(&self, status: &DeploymentStatusRow) -> StoreResult<()> {
        let value = serde_json::to_vec(status).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = match deployments
                .get(status.deployment_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StoreError::ForeignKey(format!(
                        "deployment {} does not exist",
                        status.deployment_id
                    )));
                }
            };

            let mut statuses = txn.open_table(STATUSES).map_err(map_err!(Table))?;
            let (start, end) = prefix_bounds(&status.deployment_id);
            let seq = statuses
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .count();

            let key = format!("{}/{seq:012}", status.deployment_id);
            statuses
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            deployment.state = Some(status.state.clone());
            let deployment_value =
                serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            deployments
                .insert(deployment.id.as_str(), deployment_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            deployment_id = %status.deployment_id,
            state = %status.state,
            "deployment status stored"
        );
        Ok(())
    }

    /// Status history of a deployment, in append order.
    pub fn statuses(&self, deployment_id: &str) -> StoreResult<Vec<DeploymentStatusRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUSES).map_err(map_err!(Table))?;
        let (start, end) = prefix_bounds(deployment_id);
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let status = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(status);
        }
        Ok(results)
    }

    // ── Resource identifiers ───────────────────────────────────────

    /// Record one resource identifier of a request. Write-once.
    pub fn write_resource(&self, resource: &DeploymentResourceRow) -> StoreResult<()> {
        let value = serde_json::to_vec(resource).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if deployments
                .get(resource.deployment_id.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StoreError::ForeignKey(format!(
                    "deployment {} does not exist",
                    resource.deployment_id
                )));
            }

            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            let key = format!("{}/{:04}", resource.deployment_id, resource.index);
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Resource identifiers of a deployment, in submission order.
    pub fn resources(&self, deployment_id: &str) -> StoreResult<Vec<DeploymentResourceRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        let (start, end) = prefix_bounds(deployment_id);
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let resource = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(resource);
        }
        Ok(results)
    }

    // ── API keys ───────────────────────────────────────────────────

    /// All API keys for a team, decrypted, newest first.
    ///
    /// Fails with [`StoreError::NotFound`] when the team has no keys at
    /// all; expiry filtering is the caller's concern.
    pub fn api_keys(&self, team: &str) -> StoreResult<Vec<ApiKey>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APIKEYS).map_err(map_err!(Table))?;
        let (start, end) = prefix_bounds(team);
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stored: StoredApiKey =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let ciphertext = hex::decode(&stored.key)
                .map_err(|e| StoreError::Crypto(format!("decode hex: {e}")))?;
            results.push(ApiKey {
                team: stored.team,
                group_id: stored.group_id,
                key: crypto::decrypt(&ciphertext, &self.encryption_key)?,
                created: stored.created,
                expires: stored.expires,
            });
        }
        if results.is_empty() {
            return Err(StoreError::NotFound(format!("no API keys for team {team}")));
        }
        results.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(results)
    }

    /// Rotate a team's API key.
    ///
    /// Expires every currently-valid key for the team and inserts the new
    /// one in the same transaction, so both keys validate during the
    /// rotation window but only the new one after.
    pub fn rotate_api_key(&self, team: &str, group_id: &str, key: &[u8]) -> StoreResult<()> {
        let now = Utc::now();
        let encrypted = crypto::encrypt(key, &self.encryption_key)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APIKEYS).map_err(map_err!(Table))?;
            let (start, end) = prefix_bounds(team);

            let mut expired = Vec::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (k, value) = entry.map_err(map_err!(Read))?;
                let mut stored: StoredApiKey =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if stored.expires > now {
                    stored.expires = now;
                    expired.push((k.value().to_string(), stored));
                }
            }
            for (k, stored) in expired {
                let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
                table
                    .insert(k.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let stored = StoredApiKey {
                team: team.to_string(),
                group_id: group_id.to_string(),
                key: hex::encode(&encrypted),
                created: now,
                expires: now + Duration::days(APIKEY_LIFETIME_DAYS),
            };
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            let key_id = Uuid::new_v4();
            let row_key = format!("{team}/{key_id}");
            table
                .insert(row_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%team, "api key rotated");
        Ok(())
    }
}
