//! Job watcher.
//!
//! Polls the Job's status conditions until it reports `Complete` or
//! `Failed`, bounded by the request deadline.

use std::sync::Arc;

use tracing::debug;

use crate::kube::WorkloadApi;

use super::{ERR_TIMEOUT, POLL_INTERVAL, WatchContext, WatchOutcome};

pub async fn watch(api: Arc<dyn WorkloadApi>, ctx: WatchContext) -> WatchOutcome {
    let namespace = &ctx.resource.namespace;
    let name = &ctx.resource.name;

    loop {
        match api.job_conditions(namespace, name).await {
            Ok(Some(conditions)) => {
                if conditions.iter().any(|c| c.condition_type == "Complete") {
                    return WatchOutcome::Success;
                }
                if let Some(failed) = conditions.iter().find(|c| c.condition_type == "Failed") {
                    return WatchOutcome::Failure(format!("job failed: {failed}"));
                }
                debug!(%name, "still waiting for job to complete");
            }
            Ok(None) => debug!(%name, "job not present yet"),
            Err(e) => debug!(%name, error = %e, "recoverable error while polling job"),
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::time::sleep_until(ctx.deadline) => {
                return WatchOutcome::Error(ERR_TIMEOUT.to_string());
            }
            _ = ctx.cancel.cancelled() => {
                return WatchOutcome::Error("rollout watch cancelled".to_string());
            }
        }
    }
}
