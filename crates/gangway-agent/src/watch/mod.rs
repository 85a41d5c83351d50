//! Rollout watchers.
//!
//! One watcher per applied resource; each is a small state machine that
//! consults the Kubernetes API until it can pronounce the rollout
//! succeeded, failed, or errored. The variant is picked by
//! `{group, version, kind}`; kinds without a watcher are terminal
//! successes the moment they are applied.

pub mod application;
pub mod deployment;
pub mod job;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gangway_proto::{DeploymentRequest, DeploymentStatus, ResourceId};

use crate::kube::WorkloadApi;

/// Poll cadence for the Deployment and Job watchers, and the retry
/// interval for failed API reads.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Canonical timeout wording; the client greps for "timeout".
pub const ERR_TIMEOUT: &str = "timeout while waiting for deployment to succeed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    Application,
    Deployment,
    Job,
    NoOp,
}

pub fn strategy_for(id: &ResourceId) -> WatchStrategy {
    if id.group == "nais.io" && id.kind == "Application" {
        return WatchStrategy::Application;
    }
    if id.kind == "Deployment" && (id.group == "apps" || id.group == "extensions") {
        return WatchStrategy::Deployment;
    }
    if id.group == "batch" && id.version == "v1" && id.kind == "Job" {
        return WatchStrategy::Job;
    }
    WatchStrategy::NoOp
}

/// Terminal verdict of one watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Success,
    /// The rollout itself failed; the message names the resource.
    Failure(String),
    /// The watcher could not determine the rollout's fate (timeouts,
    /// unreachable API).
    Error(String),
}

impl WatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WatchOutcome::Success)
    }

    pub fn message(&self) -> &str {
        match self {
            WatchOutcome::Success => "",
            WatchOutcome::Failure(msg) | WatchOutcome::Error(msg) => msg,
        }
    }
}

/// Shared state of one watcher run.
pub struct WatchContext {
    pub request: DeploymentRequest,
    pub resource: ResourceId,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub status_tx: mpsc::Sender<DeploymentStatus>,
}

impl WatchContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Relay an intermediate (non-terminal) status.
    pub async fn report(&self, status: DeploymentStatus) {
        let _ = self.status_tx.send(status).await;
    }
}

/// Run the watcher for one applied resource to its terminal outcome.
pub async fn watch(
    strategy: WatchStrategy,
    api: Arc<dyn WorkloadApi>,
    ctx: WatchContext,
) -> WatchOutcome {
    match strategy {
        WatchStrategy::Application => application::watch(api, ctx).await,
        WatchStrategy::Deployment => deployment::watch(api, ctx).await,
        WatchStrategy::Job => job::watch(api, ctx).await,
        WatchStrategy::NoOp => {
            debug!(resource = %ctx.resource, "no rollout watcher for this kind");
            WatchOutcome::Success
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;

    use crate::kube::{
        DeploymentProgress, EventStream, JobCondition, KubeError, WorkloadApi, WorkloadEvent,
    };

    /// Scripted workload API: events are replayed once, poll answers are
    /// consumed front-to-back with the last one repeating forever.
    #[derive(Default)]
    pub struct FakeWorkloadApi {
        pub events: Mutex<Vec<WorkloadEvent>>,
        pub deployments: Mutex<VecDeque<Option<DeploymentProgress>>>,
        pub jobs: Mutex<VecDeque<Option<Vec<JobCondition>>>>,
    }

    impl FakeWorkloadApi {
        pub fn with_events(events: Vec<WorkloadEvent>) -> Self {
            FakeWorkloadApi {
                events: Mutex::new(events),
                ..Default::default()
            }
        }

        pub fn with_deployments(answers: Vec<Option<DeploymentProgress>>) -> Self {
            FakeWorkloadApi {
                deployments: Mutex::new(answers.into()),
                ..Default::default()
            }
        }

        pub fn with_jobs(answers: Vec<Option<Vec<JobCondition>>>) -> Self {
            FakeWorkloadApi {
                jobs: Mutex::new(answers.into()),
                ..Default::default()
            }
        }

        fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    #[async_trait]
    impl WorkloadApi for FakeWorkloadApi {
        async fn watch_events(
            &self,
            _namespace: &str,
            _timeout: std::time::Duration,
        ) -> Result<EventStream, KubeError> {
            let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
            let stream = futures::stream::iter(events.into_iter().map(Ok)).chain(
                futures::stream::pending(),
            );
            Ok(stream.boxed())
        }

        async fn deployment_progress(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<DeploymentProgress>, KubeError> {
            Ok(Self::next(&self.deployments).flatten())
        }

        async fn job_conditions(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<Vec<JobCondition>>, KubeError> {
            Ok(Self::next(&self.jobs).flatten())
        }
    }

    pub fn context(
        kind: &str,
        name: &str,
        deadline: std::time::Duration,
    ) -> (
        super::WatchContext,
        tokio::sync::mpsc::Receiver<gangway_proto::DeploymentStatus>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let ctx = super::WatchContext {
            request: gangway_proto::DeploymentRequest {
                id: "corr-1".to_string(),
                ..Default::default()
            },
            resource: gangway_proto::ResourceId {
                group: if kind == "Application" {
                    "nais.io".to_string()
                } else {
                    "apps".to_string()
                },
                version: "v1".to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: "aura".to_string(),
            },
            deadline: tokio::time::Instant::now() + deadline,
            cancel: tokio_util::sync::CancellationToken::new(),
            status_tx: tx,
        };
        (ctx, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(group: &str, version: &str, kind: &str) -> ResourceId {
        ResourceId {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            name: "x".to_string(),
            namespace: "ns".to_string(),
        }
    }

    #[test]
    fn strategy_selection_by_gvk() {
        assert_eq!(
            strategy_for(&id("nais.io", "v1alpha1", "Application")),
            WatchStrategy::Application
        );
        assert_eq!(
            strategy_for(&id("apps", "v1", "Deployment")),
            WatchStrategy::Deployment
        );
        assert_eq!(
            strategy_for(&id("extensions", "v1beta1", "Deployment")),
            WatchStrategy::Deployment
        );
        assert_eq!(strategy_for(&id("batch", "v1", "Job")), WatchStrategy::Job);
        assert_eq!(strategy_for(&id("", "v1", "ConfigMap")), WatchStrategy::NoOp);
        assert_eq!(
            strategy_for(&id("batch", "v1beta1", "CronJob")),
            WatchStrategy::NoOp
        );
    }

    #[tokio::test]
    async fn noop_watcher_is_immediate_success() {
        let (ctx, _rx) = testutil::context("ConfigMap", "foo", Duration::from_secs(60));
        let api = Arc::new(testutil::FakeWorkloadApi::default());
        let outcome = watch(WatchStrategy::NoOp, api, ctx).await;
        assert_eq!(outcome, WatchOutcome::Success);
    }
}
