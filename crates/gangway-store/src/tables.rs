//! redb table definitions for the Gangway state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Child rows use composite keys `{deployment_id}/{suffix}` so a
//! deployment's history can be read back with a single range scan; the
//! suffix is zero-padded to keep lexicographic and insertion order equal.

use redb::TableDefinition;

/// Deployments keyed by `{id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment");

/// Status history keyed by `{deployment_id}/{seq:012}`.
pub const STATUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_status");

/// Resource identifiers keyed by `{deployment_id}/{index:04}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_resource");

/// API keys keyed by `{team}/{key_id}`.
pub const APIKEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("apikey");
