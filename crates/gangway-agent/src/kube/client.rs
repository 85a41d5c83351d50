//! The dynamic REST client.
//!
//! Speaks plain HTTP+JSON against the API server: discovery for REST
//! mappings, dynamic collections for reads and writes, and the Events
//! watch endpoint for the application rollout watcher. Team calls carry
//! an `Impersonate-User` header so RBAC enforces the team boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::debug;

use gangway_proto::ResourceId;

use super::discovery::{self, RestMapping};
use super::{
    ApplyOutcome, ClusterClient, DeploymentProgress, DynamicResource, EventStream, JobCondition,
    KubeError, TeamClientProvider, WorkloadApi, WorkloadEvent, service_user,
};
use crate::CORRELATION_ANNOTATION;

/// How to reach the API server.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Base URL, e.g. `https://10.0.0.1:6443`.
    pub api_url: String,
    /// Bearer token of the agent's own service account.
    pub token: String,
}

/// Shared client for one cluster's API server.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base: String,
    token: String,
    mappings: Arc<RwLock<HashMap<String, RestMapping>>>,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> Result<Self, KubeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        Ok(KubeClient {
            http,
            base: config.api_url.trim_end_matches('/').to_string(),
            token: config.token,
            mappings: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str, user: Option<&str>) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        if let Some(user) = user {
            builder = builder.header("Impersonate-User", user);
        }
        builder
    }

    /// REST mapping for a kind, resolved through discovery and cached.
    async fn rest_mapping(&self, id: &ResourceId) -> Result<RestMapping, KubeError> {
        let cache_key = format!("{}/{}", id.api_version(), id.kind);
        if let Some(mapping) = self.mappings.read().await.get(&cache_key) {
            return Ok(mapping.clone());
        }

        let url = format!("{}/{}", self.base, discovery::group_version_path(id));
        let response = self
            .request(reqwest::Method::GET, &url, None)
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KubeError::Discovery(format!(
                "group version {} is not served ({})",
                id.api_version(),
                response.status()
            )));
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| KubeError::Discovery(e.to_string()))?;

        let mapping = discovery::mapping_from_discovery(id, &document)?;
        debug!(kind = %id.kind, plural = %mapping.plural, "discovered rest mapping");
        self.mappings
            .write()
            .await
            .insert(cache_key, mapping.clone());
        Ok(mapping)
    }

    fn handle(&self, mapping: &RestMapping, namespace: &str, user: Option<String>) -> DynamicHandle {
        DynamicHandle {
            client: self.clone(),
            collection_url: mapping.collection_url(&self.base, namespace),
            user,
        }
    }

    /// Get-or-create the team's service account (agent credentials, not
    /// impersonated, since the account may not exist yet).
    async fn ensure_service_account(&self, team: &str, namespace: &str) -> Result<(), KubeError> {
        let id = ResourceId {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ServiceAccount".to_string(),
            name: format!("serviceuser-{team}"),
            namespace: namespace.to_string(),
        };
        let mapping = self.rest_mapping(&id).await?;
        let handle = self.handle(&mapping, namespace, None);

        match handle.get(&id.name).await {
            Ok(_) => Ok(()),
            Err(KubeError::NotFound) => {
                debug!(name = %id.name, %namespace, "creating team service account");
                let account = json!({
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": {"name": id.name, "namespace": namespace},
                });
                handle.create(&account).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TeamClientProvider for KubeClient {
    async fn team_client(
        &self,
        team: &str,
        service_account_namespace: &str,
        auto_create_service_account: bool,
    ) -> Result<Arc<dyn ClusterClient>, KubeError> {
        if auto_create_service_account {
            self.ensure_service_account(team, service_account_namespace)
                .await?;
        }
        Ok(Arc::new(TeamClient {
            kube: self.clone(),
            user: service_user(team, service_account_namespace),
        }))
    }
}

/// One team's impersonated session against the cluster.
#[derive(Clone)]
pub struct TeamClient {
    kube: KubeClient,
    user: String,
}

#[async_trait]
impl ClusterClient for TeamClient {
    async fn resource_handle(
        &self,
        id: &ResourceId,
        namespace: &str,
    ) -> Result<Box<dyn DynamicResource>, KubeError> {
        let mapping = self.kube.rest_mapping(id).await?;
        Ok(Box::new(self.kube.handle(
            &mapping,
            namespace,
            Some(self.user.clone()),
        )))
    }

    fn workload_api(&self) -> Arc<dyn WorkloadApi> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl WorkloadApi for TeamClient {
    async fn watch_events(
        &self,
        namespace: &str,
        timeout: Duration,
    ) -> Result<EventStream, KubeError> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/events",
            self.kube.base
        );
        let response = self
            .kube
            .request(reqwest::Method::GET, &url, Some(&self.user))
            .query(&[
                ("watch", "true".to_string()),
                ("timeoutSeconds", timeout.as_secs().max(1).to_string()),
                ("resourceVersion", "0".to_string()),
            ])
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        Ok(event_lines(response))
    }

    async fn deployment_progress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentProgress>, KubeError> {
        let url = format!(
            "{}/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
            self.kube.base
        );
        match self.fetch(&url).await? {
            Some(doc) => Ok(Some(progress_from_document(&doc))),
            None => Ok(None),
        }
    }

    async fn job_conditions(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Vec<JobCondition>>, KubeError> {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{namespace}/jobs/{name}",
            self.kube.base
        );
        match self.fetch(&url).await? {
            Some(doc) => Ok(Some(conditions_from_document(&doc))),
            None => Ok(None),
        }
    }
}

impl TeamClient {
    async fn fetch(&self, url: &str) -> Result<Option<Value>, KubeError> {
        let response = self
            .kube
            .request(reqwest::Method::GET, url, Some(&self.user))
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| KubeError::Transport(e.to_string()))
    }
}

/// A resource collection bound to a URL and an impersonated principal.
struct DynamicHandle {
    client: KubeClient,
    collection_url: String,
    user: Option<String>,
}

impl DynamicHandle {
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url, self.user.as_deref())
    }
}

#[async_trait]
impl DynamicResource for DynamicHandle {
    async fn get(&self, name: &str) -> Result<Value, KubeError> {
        let url = format!("{}/{name}", self.collection_url);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(KubeError::NotFound);
        }
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))
    }

    async fn create(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
        let response = self
            .request(reqwest::Method::POST, &self.collection_url)
            .query(&[("fieldValidation", "Warn")])
            .json(object)
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        outcome_from_response(response).await
    }

    async fn update(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| KubeError::Api("object has no metadata.name".to_string()))?;
        let url = format!("{}/{name}", self.collection_url);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .query(&[("fieldValidation", "Warn")])
            .json(object)
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        outcome_from_response(response).await
    }

    async fn delete(&self, name: &str) -> Result<(), KubeError> {
        let url = format!("{}/{name}", self.collection_url);
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(KubeError::NotFound);
        }
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }
        Ok(())
    }
}

/// API-server error with the server's own message when available.
async fn error_from_status(response: reqwest::Response) -> KubeError {
    let status = response.status();
    let message = match response.json::<Value>().await {
        Ok(body) => body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    };
    KubeError::Api(message)
}

async fn outcome_from_response(response: reqwest::Response) -> Result<ApplyOutcome, KubeError> {
    let warnings = response
        .headers()
        .get_all("warning")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(parse_warning_header)
        .collect();

    if !response.status().is_success() {
        return Err(error_from_status(response).await);
    }
    let object = response
        .json()
        .await
        .map_err(|e| KubeError::Transport(e.to_string()))?;
    Ok(ApplyOutcome { object, warnings })
}

/// Strip the `299 - "..."` framing of a Kubernetes warning header and
/// unescape the quoted-string payload.
fn parse_warning_header(raw: &str) -> String {
    let raw = raw.trim();
    let stripped = raw.strip_prefix("299").map(str::trim_start).unwrap_or(raw);
    let stripped = stripped.strip_prefix('-').map(str::trim_start).unwrap_or(stripped);
    match stripped
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        Some(quoted) => quoted.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => stripped.to_string(),
    }
}

/// Turn a chunked watch response into a stream of events, one JSON line
/// per watch notification. Non-Event lines (bookmarks, other kinds) are
/// skipped.
fn event_lines(response: reqwest::Response) -> EventStream {
    let stream = futures::stream::unfold(
        (response.bytes_stream(), Vec::<u8>::new()),
        |(mut body, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match event_from_watch_line(line) {
                        Some(event) => return Some((Ok(event), (body, buffer))),
                        None => continue,
                    }
                }
                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(KubeError::Transport(e.to_string())), (body, buffer)));
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}

fn event_from_watch_line(line: &str) -> Option<WorkloadEvent> {
    let notification: Value = serde_json::from_str(line).ok()?;
    workload_event_from_object(notification.get("object")?)
}

fn workload_event_from_object(object: &Value) -> Option<WorkloadEvent> {
    if object.get("kind").and_then(Value::as_str) != Some("Event") {
        return None;
    }
    let text = |pointer: &str| {
        object
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    // core/v1 serializes the reporting controller as `reportingComponent`.
    let mut reporting_controller = text("/reportingController");
    if reporting_controller.is_empty() {
        reporting_controller = text("/reportingComponent");
    }

    Some(WorkloadEvent {
        name: text("/metadata/name"),
        namespace: text("/metadata/namespace"),
        reason: text("/reason"),
        message: text("/message"),
        reporting_controller,
        correlation_id: object
            .pointer(&format!(
                "/metadata/annotations/{}",
                CORRELATION_ANNOTATION.replace('/', "~1")
            ))
            .and_then(Value::as_str)
            .map(str::to_string),
        involved_kind: text("/involvedObject/kind"),
        involved_name: text("/involvedObject/name"),
        last_timestamp: object
            .pointer("/lastTimestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn progress_from_document(doc: &Value) -> DeploymentProgress {
    let int = |pointer: &str| doc.pointer(pointer).and_then(Value::as_i64).unwrap_or(0);
    DeploymentProgress {
        resource_version: doc
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        spec_replicas: doc
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(1),
        replicas: int("/status/replicas"),
        updated_replicas: int("/status/updatedReplicas"),
        available_replicas: int("/status/availableReplicas"),
        generation: int("/metadata/generation"),
        observed_generation: int("/status/observedGeneration"),
    }
}

fn conditions_from_document(doc: &Value) -> Vec<JobCondition> {
    doc.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| {
                    let text = |key: &str| {
                        c.get(key)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    JobCondition {
                        condition_type: text("type"),
                        status: text("status"),
                        reason: text("reason"),
                        message: text("message"),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}
