//! Dynamic Kubernetes access.
//!
//! The agent never links a generated client; it speaks the discovery and
//! dynamic-resource REST protocol directly and moves `serde_json::Value`
//! documents around. Trait seams ([`DynamicResource`], [`WorkloadApi`],
//! [`TeamClientProvider`]) keep the apply engine and the rollout watchers
//! testable without a cluster.

pub mod apply;
pub mod client;
pub mod discovery;
pub mod warnings;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("resource not found")]
    NotFound,

    /// The API server rejected the call; the message is the server's own
    /// (including RBAC denials such as `... is forbidden: User ...`).
    #[error("{0}")]
    Api(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("discovery error: {0}")]
    Discovery(String),
}

impl KubeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound)
    }
}

/// Result of a create/update call: the stored object plus any warnings
/// the API server attached (unknown fields under `fieldValidation=Warn`).
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub object: Value,
    pub warnings: Vec<String>,
}

/// One named resource collection, scoped to a namespace when applicable.
#[async_trait]
pub trait DynamicResource: Send + Sync {
    async fn get(&self, name: &str) -> Result<Value, KubeError>;
    async fn create(&self, object: &Value) -> Result<ApplyOutcome, KubeError>;
    async fn update(&self, object: &Value) -> Result<ApplyOutcome, KubeError>;
    async fn delete(&self, name: &str) -> Result<(), KubeError>;
}

/// A cluster Event, reduced to the fields the watchers consult.
#[derive(Debug, Clone)]
pub struct WorkloadEvent {
    pub name: String,
    pub namespace: String,
    pub reason: String,
    pub message: String,
    pub reporting_controller: String,
    /// Value of the correlation annotation, when present.
    pub correlation_id: Option<String>,
    pub involved_kind: String,
    pub involved_name: String,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Rollout-relevant numbers of an `apps/v1` Deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentProgress {
    pub resource_version: u64,
    pub spec_replicas: i64,
    pub replicas: i64,
    pub updated_replicas: i64,
    pub available_replicas: i64,
    pub generation: i64,
    pub observed_generation: i64,
}

/// One entry of a `batch/v1` Job's `status.conditions`.
#[derive(Debug, Clone)]
pub struct JobCondition {
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

impl std::fmt::Display for JobCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.condition_type, self.reason, self.message
        )
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WorkloadEvent, KubeError>> + Send>>;

/// Read access the rollout watchers need, impersonated like the writes.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Watch Events in a namespace, bounded by `timeout`.
    async fn watch_events(&self, namespace: &str, timeout: Duration)
    -> Result<EventStream, KubeError>;

    /// `None` when the Deployment does not exist.
    async fn deployment_progress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentProgress>, KubeError>;

    /// `None` when the Job does not exist.
    async fn job_conditions(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Vec<JobCondition>>, KubeError>;
}

/// Everything the request driver needs from one team-scoped session.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Dynamic handle for the resource's collection, resolved through the
    /// discovery REST mapping.
    async fn resource_handle(
        &self,
        id: &gangway_proto::ResourceId,
        namespace: &str,
    ) -> Result<Box<dyn DynamicResource>, KubeError>;

    fn workload_api(&self) -> Arc<dyn WorkloadApi>;
}

/// Hands out team-impersonated sessions.
#[async_trait]
pub trait TeamClientProvider: Send + Sync {
    async fn team_client(
        &self,
        team: &str,
        service_account_namespace: &str,
        auto_create_service_account: bool,
    ) -> Result<Arc<dyn ClusterClient>, KubeError>;
}

/// Principal the agent impersonates on behalf of a team.
pub fn service_user(team: &str, namespace: &str) -> String {
    format!("system:serviceaccount:{namespace}:serviceuser-{team}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_user_format() {
        assert_eq!(
            service_user("aura", "aura"),
            "system:serviceaccount:aura:serviceuser-aura"
        );
        assert_eq!(
            service_user("aura", "default"),
            "system:serviceaccount:default:serviceuser-aura"
        );
    }

    #[test]
    fn job_condition_display() {
        let condition = JobCondition {
            condition_type: "Failed".to_string(),
            status: "True".to_string(),
            reason: "BackoffLimitExceeded".to_string(),
            message: "Job has reached the specified backoff limit".to_string(),
        };
        assert_eq!(
            condition.to_string(),
            "Failed (BackoffLimitExceeded): Job has reached the specified backoff limit"
        );
    }
}
