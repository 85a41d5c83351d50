//! Deployment rollout watcher.
//!
//! Two phases: record the resourceVersion as it was at apply time
//! (NotFound counts as 0), then poll until a newer generation of the
//! object is fully rolled out.

use std::sync::Arc;

use tracing::debug;

use crate::kube::{DeploymentProgress, WorkloadApi};

use super::{ERR_TIMEOUT, POLL_INTERVAL, WatchContext, WatchOutcome};

pub async fn watch(api: Arc<dyn WorkloadApi>, ctx: WatchContext) -> WatchOutcome {
    let namespace = &ctx.resource.namespace;
    let name = &ctx.resource.name;

    // Phase A: the version to beat.
    let mut recorded_version = loop {
        match api.deployment_progress(namespace, name).await {
            Ok(Some(progress)) => {
                debug!(%name, version = progress.resource_version, "found current deployment");
                break progress.resource_version;
            }
            Ok(None) => {
                debug!(%name, "deployment not currently present in the cluster");
                break 0;
            }
            Err(e) => {
                debug!(%name, error = %e, "recoverable error while polling for deployment");
                if let Some(outcome) = pause(&ctx).await {
                    return outcome;
                }
            }
        }
    };

    // Phase B: wait for a newer version to become fully available.
    let mut updated = false;
    loop {
        match api.deployment_progress(namespace, name).await {
            Ok(Some(progress)) => {
                if progress.resource_version > recorded_version {
                    debug!(
                        %name,
                        version = progress.resource_version,
                        "new deployment generation appeared"
                    );
                    recorded_version = progress.resource_version;
                    updated = true;
                }
                if updated && complete(&progress) {
                    return WatchOutcome::Success;
                }
                debug!(
                    %name,
                    replicas = progress.replicas,
                    updated_replicas = progress.updated_replicas,
                    available_replicas = progress.available_replicas,
                    observed_generation = progress.observed_generation,
                    "still waiting for deployment to finish rollout"
                );
            }
            Ok(None) => debug!(%name, "deployment not present yet"),
            Err(e) => debug!(%name, error = %e, "recoverable error while polling deployment"),
        }

        if let Some(outcome) = pause(&ctx).await {
            return outcome;
        }
    }
}

/// Sleep one poll interval; yields an outcome when the watch must end.
async fn pause(ctx: &WatchContext) -> Option<WatchOutcome> {
    tokio::select! {
        _ = tokio::time::sleep(POLL_INTERVAL) => None,
        _ = tokio::time::sleep_until(ctx.deadline) => {
            Some(WatchOutcome::Error(ERR_TIMEOUT.to_string()))
        }
        _ = ctx.cancel.cancelled() => {
            Some(WatchOutcome::Error("rollout watch cancelled".to_string()))
        }
    }
}

/// All desired replicas are updated and available, and the controller
/// has observed the latest generation.
fn complete(progress: &DeploymentProgress) -> bool {
    progress.updated_replicas == progress.spec_replicas
        && progress.replicas == progress.spec_replicas
        && progress.available_replicas == progress.spec_replicas
        && progress.observed_generation >= progress.generation
}
