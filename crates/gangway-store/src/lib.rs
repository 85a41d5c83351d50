//! gangway-store — durable state for the Gangway dispatcher.
//!
//! Holds the four persisted record kinds: deployments, their append-only
//! status history, the denormalized resource identifiers of each request,
//! and per-team API keys (encrypted at rest). All values are
//! JSON-serialized into redb's `&[u8]` value columns; referential
//! integrity between statuses/resources and their deployment is enforced
//! inside the write transaction.

pub mod crypto;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use crypto::EncryptionKey;
pub use error::{StoreError, StoreResult};
pub use store::StateStore;
pub use types::{ApiKey, Deployment, DeploymentResourceRow, DeploymentStatusRow};
