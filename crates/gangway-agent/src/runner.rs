//! The per-request driver.
//!
//! Applies the request's resources in submission order, starts one
//! rollout watcher per applied resource, and aggregates the watcher
//! verdicts into exactly one terminal status. A per-resource apply
//! failure cancels the whole operation.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use gangway_proto::{DeploymentStatus, ResourceId};

use crate::CORRELATION_ANNOTATION;
use crate::kube::{ApplyOutcome, ClusterClient, KubeError, TeamClientProvider, apply, warnings};
use crate::operation::Operation;
use crate::watch::{self, WatchContext, WatchOutcome};

/// Namespace the team service account lives in when team namespaces are
/// disabled.
const DEFAULT_TEAMCLIENT_NAMESPACE: &str = "default";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name of the cluster this agent serves; requests addressed
    /// elsewhere are dropped.
    pub cluster: String,
    /// Impersonate the team's service account in its own namespace
    /// rather than in `default`.
    pub team_namespaces: bool,
    pub auto_create_service_account: bool,
}

/// Drive one deployment request to a terminal status.
pub async fn run(op: Operation, provider: Arc<dyn TeamClientProvider>, cfg: RunnerConfig) {
    let request = op.request.clone();
    info!(id = %request.id, team = %request.team, "starting deployment");

    // Misrouted messages belong to another cluster's agent; they get no
    // status from us.
    if request.cluster != cfg.cluster {
        warn!(
            id = %request.id,
            addressed_to = %request.cluster,
            serving = %cfg.cluster,
            "dropping deployment request addressed to another cluster"
        );
        return;
    }

    if op.remaining().is_zero() {
        op.report(DeploymentStatus::error(&request, "deployment timed out")).await;
        return;
    }

    let resources = match op.extract_resources() {
        Ok(resources) => resources,
        Err(e) => {
            op.report(DeploymentStatus::error(&request, e)).await;
            return;
        }
    };

    let service_account_namespace = if cfg.team_namespaces {
        request.team.clone()
    } else {
        DEFAULT_TEAMCLIENT_NAMESPACE.to_string()
    };
    let team = match provider
        .team_client(
            &request.team,
            &service_account_namespace,
            cfg.auto_create_service_account,
        )
        .await
    {
        Ok(team) => team,
        Err(e) => {
            op.report(DeploymentStatus::error(
                &request,
                format!("unable to create team client: {e}"),
            ))
            .await;
            return;
        }
    };

    let api = team.workload_api();
    let mut watchers: JoinSet<WatchOutcome> = JoinSet::new();

    for (index, mut resource) in resources.into_iter().enumerate() {
        annotate_correlation(&mut resource, &request.id);
        let id = ResourceId::from_document(&resource);

        let applied = tokio::time::timeout(
            op.remaining(),
            apply_one(team.as_ref(), &id, &resource),
        )
        .await;

        let outcome = match applied {
            Err(_elapsed) => {
                abort_watchers(&op, &mut watchers).await;
                op.report(DeploymentStatus::error(&request, "deployment timed out")).await;
                return;
            }
            Ok(Err(e)) => {
                warn!(id = %request.id, resource = %id, error = %e, "apply failed");
                abort_watchers(&op, &mut watchers).await;
                op.report(DeploymentStatus::failure(
                    &request,
                    format!("resource {}: {id}: {e}", index + 1),
                ))
                .await;
                return;
            }
            Ok(Ok(outcome)) => outcome,
        };

        publish_warnings(team.as_ref(), &id, &outcome, &request.id).await;

        info!(id = %request.id, resource = %id, "resource applied");
        op.report(DeploymentStatus::in_progress(
            &request,
            format!("Successfully applied {id}"),
        ))
        .await;

        let ctx = WatchContext {
            request: request.clone(),
            resource: id.clone(),
            deadline: op.deadline,
            cancel: op.cancel.clone(),
            status_tx: op.status_tx.clone(),
        };
        let strategy = watch::strategy_for(&id);
        let api = api.clone();
        watchers.spawn(async move { watch::watch(strategy, api, ctx).await });
    }

    op.report(DeploymentStatus::in_progress(
        &request,
        "All resources saved to Kubernetes; waiting for deployment to complete.",
    ))
    .await;

    let mut failures: Vec<WatchOutcome> = Vec::new();
    while let Some(joined) = watchers.join_next().await {
        match joined {
            Ok(outcome) if outcome.is_success() => {}
            Ok(outcome) => failures.push(outcome),
            Err(e) => failures.push(WatchOutcome::Error(format!("rollout watcher failed: {e}"))),
        }
    }

    if failures.is_empty() {
        info!(id = %request.id, "deployment succeeded");
        op.report(DeploymentStatus::success(&request)).await;
    } else {
        let message = format!(
            "{} (total of {} errors)",
            failures[0].message(),
            failures.len()
        );
        let status = match &failures[0] {
            WatchOutcome::Error(_) => DeploymentStatus::error(&request, message),
            _ => DeploymentStatus::failure(&request, message),
        };
        op.report(status).await;
    }
}

async fn apply_one(
    team: &dyn ClusterClient,
    id: &ResourceId,
    resource: &Value,
) -> Result<ApplyOutcome, KubeError> {
    let handle = team.resource_handle(id, &id.namespace).await?;
    apply::apply(apply::strategy_for(id), handle.as_ref(), resource).await
}

/// Cancel in-flight watchers and wait them out, discarding their
/// verdicts; the caller is about to report the one terminal status.
async fn abort_watchers(op: &Operation, watchers: &mut JoinSet<WatchOutcome>) {
    op.cancel.cancel();
    while watchers.join_next().await.is_some() {}
}

async fn publish_warnings(
    team: &dyn ClusterClient,
    id: &ResourceId,
    outcome: &ApplyOutcome,
    correlation_id: &str,
) {
    if outcome.warnings.is_empty() {
        return;
    }
    let events_id = ResourceId {
        group: String::new(),
        version: "v1".to_string(),
        kind: "Event".to_string(),
        name: String::new(),
        namespace: id.namespace.clone(),
    };
    match team.resource_handle(&events_id, &id.namespace).await {
        Ok(events) => warnings::publish(events.as_ref(), id, &outcome.warnings, correlation_id).await,
        Err(e) => warn!(resource = %id, error = %e, "unable to publish warning events"),
    }
}

/// Stamp the correlation ID so watchers can tell this deployment apart
/// from a later one.
fn annotate_correlation(resource: &mut Value, correlation_id: &str) {
    let Some(object) = resource.as_object_mut() else {
        return;
    };
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(metadata) = metadata.as_object_mut() {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                CORRELATION_ANNOTATION.to_string(),
                Value::String(correlation_id.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::apply::tests::FakeCollection;
    use crate::kube::{DynamicResource, WorkloadApi};
    use crate::watch::testutil::FakeWorkloadApi;
    use async_trait::async_trait;
    use gangway_proto::{DeploymentRequest, DeploymentState, Kubernetes, time};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct SharedCollection(Arc<FakeCollection>);

    #[async_trait]
    impl DynamicResource for SharedCollection {
        async fn get(&self, name: &str) -> Result<Value, KubeError> {
            self.0.get(name).await
        }
        async fn create(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
            self.0.create(object).await
        }
        async fn update(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
            self.0.update(object).await
        }
        async fn delete(&self, name: &str) -> Result<(), KubeError> {
            self.0.delete(name).await
        }
    }

    /// Fake cluster: one collection per kind, optional forbidden kinds.
    struct FakeCluster {
        collections: Mutex<HashMap<String, Arc<FakeCollection>>>,
        api: Arc<FakeWorkloadApi>,
        forbidden_kinds: Vec<String>,
    }

    impl FakeCluster {
        fn new() -> Arc<Self> {
            Arc::new(FakeCluster {
                collections: Mutex::new(HashMap::new()),
                api: Arc::new(FakeWorkloadApi::default()),
                forbidden_kinds: vec![],
            })
        }

        fn forbidding(kind: &str) -> Arc<Self> {
            Arc::new(FakeCluster {
                collections: Mutex::new(HashMap::new()),
                api: Arc::new(FakeWorkloadApi::default()),
                forbidden_kinds: vec![kind.to_string()],
            })
        }

        fn collection(&self, kind: &str) -> Arc<FakeCollection> {
            self.collections
                .lock()
                .unwrap()
                .entry(kind.to_string())
                .or_insert_with(|| Arc::new(FakeCollection::new()))
                .clone()
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn resource_handle(
            &self,
            id: &ResourceId,
            _namespace: &str,
        ) -> Result<Box<dyn DynamicResource>, KubeError> {
            if self.forbidden_kinds.contains(&id.kind) {
                return Err(KubeError::Api(format!(
                    "{} \"{}\" is forbidden: User \"system:serviceaccount:aura:serviceuser-aura\" cannot get resource",
                    id.kind.to_lowercase(),
                    id.name
                )));
            }
            Ok(Box::new(SharedCollection(self.collection(&id.kind))))
        }

        fn workload_api(&self) -> Arc<dyn WorkloadApi> {
            self.api.clone()
        }
    }

    struct FakeProvider(Arc<FakeCluster>);

    #[async_trait]
    impl TeamClientProvider for FakeProvider {
        async fn team_client(
            &self,
            _team: &str,
            _service_account_namespace: &str,
            _auto_create_service_account: bool,
        ) -> Result<Arc<dyn ClusterClient>, KubeError> {
            Ok(self.0.clone())
        }
    }

    fn request_with(docs: Vec<Value>) -> DeploymentRequest {
        DeploymentRequest {
            id: "corr-1".to_string(),
            cluster: "dev".to_string(),
            team: "aura".to_string(),
            deadline: Some(time::from_datetime(
                chrono::Utc::now() + chrono::Duration::minutes(5),
            )),
            kubernetes: Some(Kubernetes {
                resources: docs
                    .into_iter()
                    .map(|d| serde_json::to_vec(&d).unwrap())
                    .collect(),
            }),
            ..Default::default()
        }
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            cluster: "dev".to_string(),
            team_namespaces: true,
            auto_create_service_account: false,
        }
    }

    fn configmap() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "foo", "namespace": "aura"},
        })
    }

    async fn drive(
        cluster: Arc<FakeCluster>,
        request: DeploymentRequest,
    ) -> Vec<DeploymentStatus> {
        let (tx, mut rx) = mpsc::channel(64);
        let op = Operation::new(request, tx);
        run(op, Arc::new(FakeProvider(cluster)), config()).await;

        let mut statuses = Vec::new();
        while let Ok(status) = rx.try_recv() {
            statuses.push(status);
        }
        statuses
    }

    #[tokio::test]
    async fn happy_path_configmap() {
        let cluster = FakeCluster::new();
        let statuses = drive(cluster.clone(), request_with(vec![configmap()])).await;

        let states: Vec<DeploymentState> = statuses.iter().map(|s| s.state()).collect();
        assert_eq!(
            states,
            vec![
                DeploymentState::InProgress,
                DeploymentState::InProgress,
                DeploymentState::Success,
            ]
        );
        assert!(statuses[0].message.contains("Successfully applied"));
        assert!(statuses[0].message.contains("ConfigMap"));
        assert!(statuses[1].message.contains("All resources saved"));

        // The stored object carries the correlation annotation.
        let stored = cluster.collection("ConfigMap").get("foo").await.unwrap();
        assert_eq!(
            stored["metadata"]["annotations"][CORRELATION_ANNOTATION],
            "corr-1"
        );
    }

    #[tokio::test]
    async fn resources_applied_in_submission_order() {
        let cluster = FakeCluster::new();
        let mut second = configmap();
        second["metadata"]["name"] = Value::String("bar".to_string());
        let statuses = drive(cluster, request_with(vec![configmap(), second])).await;

        assert!(statuses[0].message.contains("ConfigMap/foo"));
        assert!(statuses[1].message.contains("ConfigMap/bar"));
        assert_eq!(statuses.last().unwrap().state(), DeploymentState::Success);
    }

    #[tokio::test]
    async fn empty_payload_is_terminal_error() {
        let cluster = FakeCluster::new();
        let statuses = drive(cluster, request_with(vec![])).await;

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state(), DeploymentState::Error);
        assert_eq!(statuses[0].message, "no resources to deploy");
    }

    #[tokio::test]
    async fn forbidden_namespace_is_failure_with_rbac_message() {
        let cluster = FakeCluster::forbidding("ConfigMap");
        let statuses = drive(cluster, request_with(vec![configmap()])).await;

        let last = statuses.last().unwrap();
        assert_eq!(last.state(), DeploymentState::Failure);
        assert!(last.message.starts_with("resource 1:"));
        assert!(last.message.contains("is forbidden: User"));
    }

    #[tokio::test]
    async fn wrong_cluster_is_dropped_without_status() {
        let cluster = FakeCluster::new();
        let mut request = request_with(vec![configmap()]);
        request.cluster = "prod".to_string();
        let statuses = drive(cluster, request).await;
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn expired_deadline_is_terminal_timeout() {
        let cluster = FakeCluster::new();
        let mut request = request_with(vec![configmap()]);
        request.deadline = Some(time::from_datetime(
            chrono::Utc::now() - chrono::Duration::seconds(1),
        ));
        let statuses = drive(cluster, request).await;

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state(), DeploymentState::Error);
        assert!(statuses[0].message.contains("deployment timed out"));
    }

    #[tokio::test]
    async fn second_resource_failure_reports_its_index() {
        let cluster = FakeCluster::forbidding("Secret");
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "creds", "namespace": "aura"},
        });
        let statuses = drive(cluster, request_with(vec![configmap(), secret])).await;

        let last = statuses.last().unwrap();
        assert_eq!(last.state(), DeploymentState::Failure);
        assert!(last.message.starts_with("resource 2:"));
        assert!(last.message.contains("Secret/creds"));
    }
}
