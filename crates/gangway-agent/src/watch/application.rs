//! Application rollout watcher.
//!
//! Watches Events in the resource's namespace and reads the rollout's
//! fate out of the operator's own events. An event is authoritative only
//! when it was reported by the operator *and* carries this deployment's
//! correlation ID; a different correlation ID means the application has
//! been redeployed underneath us.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use tracing::debug;

use gangway_proto::DeploymentStatus;

use crate::kube::{WorkloadApi, WorkloadEvent};

use super::{ERR_TIMEOUT, POLL_INTERVAL, WatchContext, WatchOutcome};

/// Controller whose events decide the rollout.
const OPERATOR: &str = "naiserator";

const REASON_ROLLOUT_COMPLETE: &str = "RolloutComplete";
const REASON_FAILED_SYNCHRONIZATION: &str = "FailedSynchronization";
const REASON_FAILED_PREPARE: &str = "FailedPrepare";

enum Verdict {
    Progress,
    Success,
    Failure(String),
    Redeployed,
}

pub async fn watch(api: Arc<dyn WorkloadApi>, ctx: WatchContext) -> WatchOutcome {
    // Opening the watch is a read; retry it on the poll interval.
    let stream = loop {
        match api
            .watch_events(&ctx.resource.namespace, ctx.remaining())
            .await
        {
            Ok(stream) => break stream,
            Err(e) => {
                if ctx.remaining() <= POLL_INTERVAL {
                    return WatchOutcome::Error(format!("unable to set up event watcher: {e}"));
                }
                debug!(error = %e, "event watcher setup failed; retrying");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                    _ = ctx.cancel.cancelled() => {
                        return WatchOutcome::Error("rollout watch cancelled".to_string());
                    }
                }
            }
        }
    };
    tokio::pin!(stream);

    // Events predating the watch belong to earlier rollouts. Truncate to
    // seconds because event timestamps do.
    let watch_start = Utc::now() - chrono::Duration::seconds(1);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return WatchOutcome::Error("rollout watch cancelled".to_string());
            }
            _ = tokio::time::sleep_until(ctx.deadline) => {
                return WatchOutcome::Error(ERR_TIMEOUT.to_string());
            }
            next = stream.next() => match next {
                None => return WatchOutcome::Error(ERR_TIMEOUT.to_string()),
                Some(Err(e)) => {
                    return WatchOutcome::Error(format!("event watch failed: {e}"));
                }
                Some(Ok(event)) => {
                    if !name_matches(&event, &ctx.resource.name) {
                        debug!(event = %event.name, "ignoring unrelated event");
                        continue;
                    }
                    if let Some(ts) = event.last_timestamp {
                        if ts < watch_start {
                            debug!(event = %event.name, "ignoring old event");
                            continue;
                        }
                    }
                    match classify(&event, &ctx.request.id) {
                        Verdict::Success => return WatchOutcome::Success,
                        Verdict::Failure(message) => return WatchOutcome::Failure(message),
                        Verdict::Redeployed => {
                            return WatchOutcome::Failure(
                                "this application has been redeployed, aborting monitoring"
                                    .to_string(),
                            );
                        }
                        Verdict::Progress => {
                            ctx.report(DeploymentStatus::in_progress(
                                &ctx.request,
                                event_string(&event),
                            ))
                            .await;
                        }
                    }
                }
            }
        }
    }
}

/// `Kind/name (Reason): message`, the shape users see in their logs.
fn event_string(event: &WorkloadEvent) -> String {
    format!(
        "{}/{} ({}): {}",
        event.involved_kind, event.involved_name, event.reason, event.message
    )
}

/// Whether an event's involved object belongs to the watched resource.
///
/// Child objects carry generated suffixes: `<name>-<hash>` for a
/// ReplicaSet, `<name>-<hash>-<id>` for a Pod, `<name>(-<id>)?` for a
/// Job; anything else must match exactly.
fn name_matches(event: &WorkloadEvent, resource_name: &str) -> bool {
    let escaped = regex::escape(resource_name);
    let pattern = match event.involved_kind.as_str() {
        "Pod" => format!("^{escaped}-[a-z0-9]{{10}}-[a-z0-9]{{5}}$"),
        "ReplicaSet" => format!("^{escaped}-[a-z0-9]{{10}}$"),
        "Job" => format!("^{escaped}(-[a-z0-9]{{5}})?$"),
        _ => format!("^{escaped}$"),
    };
    Regex::new(&pattern)
        .map(|re| re.is_match(&event.involved_name))
        .unwrap_or(false)
}

fn classify(event: &WorkloadEvent, request_id: &str) -> Verdict {
    if event.reporting_controller != OPERATOR {
        return Verdict::Progress;
    }
    if event.correlation_id.as_deref() != Some(request_id) {
        return Verdict::Redeployed;
    }
    match event.reason.as_str() {
        REASON_ROLLOUT_COMPLETE => Verdict::Success,
        REASON_FAILED_SYNCHRONIZATION | REASON_FAILED_PREPARE => {
            Verdict::Failure(event_string(event))
        }
        _ => Verdict::Progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::testutil::{FakeWorkloadApi, context};
    use std::time::Duration;

    fn operator_event(reason: &str, message: &str, correlation: &str) -> WorkloadEvent {
        WorkloadEvent {
            name: "myapplication.17f".to_string(),
            namespace: "aura".to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            reporting_controller: OPERATOR.to_string(),
            correlation_id: Some(correlation.to_string()),
            involved_kind: "Application".to_string(),
            involved_name: "myapplication".to_string(),
            last_timestamp: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn rollout_complete_is_success() {
        let api = Arc::new(FakeWorkloadApi::with_events(vec![operator_event(
            "RolloutComplete",
            "rollout complete",
            "corr-1",
        )]));
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(watch(api, ctx).await, WatchOutcome::Success);
    }

    #[tokio::test]
    async fn failed_synchronization_is_failure_with_event_text() {
        let api = Arc::new(FakeWorkloadApi::with_events(vec![operator_event(
            "FailedSynchronization",
            "oops",
            "corr-1",
        )]));
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(
            watch(api, ctx).await,
            WatchOutcome::Failure(
                "Application/myapplication (FailedSynchronization): oops".to_string()
            )
        );
    }

    #[tokio::test]
    async fn mismatched_correlation_means_redeployed() {
        let api = Arc::new(FakeWorkloadApi::with_events(vec![operator_event(
            "RolloutComplete",
            "rollout complete",
            "someone-else",
        )]));
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(
            watch(api, ctx).await,
            WatchOutcome::Failure(
                "this application has been redeployed, aborting monitoring".to_string()
            )
        );
    }

    #[tokio::test]
    async fn foreign_events_stream_as_progress() {
        let mut scheduled = operator_event("Scheduled", "assigned pod", "corr-1");
        scheduled.reporting_controller = "default-scheduler".to_string();
        scheduled.involved_kind = "Pod".to_string();
        scheduled.involved_name = "myapplication-0123456789-abcde".to_string();

        let api = Arc::new(FakeWorkloadApi::with_events(vec![
            scheduled,
            operator_event("RolloutComplete", "rollout complete", "corr-1"),
        ]));
        let (ctx, mut rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(watch(api, ctx).await, WatchOutcome::Success);

        let progress = rx.recv().await.unwrap();
        assert!(progress.message.contains("(Scheduled): assigned pod"));
    }

    #[tokio::test]
    async fn unrelated_names_are_filtered() {
        let mut unrelated = operator_event("FailedSynchronization", "other app", "corr-1");
        unrelated.involved_name = "otherapplication".to_string();

        let api = Arc::new(FakeWorkloadApi::with_events(vec![
            unrelated,
            operator_event("RolloutComplete", "rollout complete", "corr-1"),
        ]));
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(watch(api, ctx).await, WatchOutcome::Success);
    }

    #[tokio::test]
    async fn stale_events_are_filtered() {
        let mut stale = operator_event("FailedSynchronization", "old failure", "corr-1");
        stale.last_timestamp = Some(Utc::now() - chrono::Duration::minutes(10));

        let api = Arc::new(FakeWorkloadApi::with_events(vec![
            stale,
            operator_event("RolloutComplete", "rollout complete", "corr-1"),
        ]));
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        assert_eq!(watch(api, ctx).await, WatchOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_events_is_timeout() {
        let api = Arc::new(FakeWorkloadApi::default());
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(30));
        assert_eq!(
            watch(api, ctx).await,
            WatchOutcome::Error(ERR_TIMEOUT.to_string())
        );
    }

    #[tokio::test]
    async fn cancellation_ends_the_watch() {
        let api = Arc::new(FakeWorkloadApi::default());
        let (ctx, _rx) = context("Application", "myapplication", Duration::from_secs(60));
        ctx.cancel.cancel();
        assert!(matches!(watch(api, ctx).await, WatchOutcome::Error(_)));
    }

    #[test]
    fn name_matching_per_kind() {
        let event = |kind: &str, name: &str| WorkloadEvent {
            name: String::new(),
            namespace: String::new(),
            reason: String::new(),
            message: String::new(),
            reporting_controller: String::new(),
            correlation_id: None,
            involved_kind: kind.to_string(),
            involved_name: name.to_string(),
            last_timestamp: None,
        };

        assert!(name_matches(&event("Application", "myapp"), "myapp"));
        assert!(!name_matches(&event("Application", "myapp-extra"), "myapp"));

        assert!(name_matches(&event("ReplicaSet", "myapp-0123456789"), "myapp"));
        assert!(!name_matches(&event("ReplicaSet", "myapp-123"), "myapp"));

        assert!(name_matches(
            &event("Pod", "myapp-0123456789-abcde"),
            "myapp"
        ));
        assert!(!name_matches(&event("Pod", "myapp-0123456789"), "myapp"));

        assert!(name_matches(&event("Job", "myjob"), "myjob"));
        assert!(name_matches(&event("Job", "myjob-ab12c"), "myjob"));
        assert!(!name_matches(&event("Job", "myjob-toolongsuffix"), "myjob"));
    }
}
