//! Surfacing apply warnings as in-cluster Events.
//!
//! Unknown-field warnings from `fieldValidation=Warn` are turned into one
//! Event per unique message. The Event name embeds a CRC-32 of the
//! message, so repeated applies overwrite instead of piling up.

use serde_json::{Value, json};
use tracing::warn;

use gangway_proto::ResourceId;

use crate::CORRELATION_ANNOTATION;

use super::apply::{self, ApplyStrategy};
use super::{DynamicResource, KubeError};

/// Deduplicating Event name: `<resource name>.<crc32(message)>`.
pub fn warning_event_name(resource_name: &str, message: &str) -> String {
    format!("{resource_name}.{:08x}", crc32fast::hash(message.as_bytes()))
}

/// Build the Event manifest for one warning on one applied resource.
pub fn warning_event(id: &ResourceId, message: &str, correlation_id: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {
            "name": warning_event_name(&id.name, message),
            "namespace": id.namespace,
            "annotations": {CORRELATION_ANNOTATION: correlation_id},
        },
        "involvedObject": {
            "apiVersion": id.api_version(),
            "kind": id.kind,
            "name": id.name,
            "namespace": id.namespace,
        },
        "reason": "FieldValidationWarning",
        "message": message,
        "type": "Warning",
        "reportingComponent": "gangway-agent",
    })
}

/// Publish one Event per warning; failures are logged, never fatal to
/// the deployment itself.
pub async fn publish(
    events: &dyn DynamicResource,
    id: &ResourceId,
    warnings: &[String],
    correlation_id: &str,
) {
    for message in warnings {
        warn!(resource = %id, %message, "field validation warning");
        let event = warning_event(id, message, correlation_id);
        if let Err(e) = apply::apply(ApplyStrategy::CreateOrUpdate, events, &event).await {
            warn!(resource = %id, error = %e, "unable to publish warning event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::apply::tests::FakeCollection;

    fn id() -> ResourceId {
        ResourceId {
            group: "nais.io".to_string(),
            version: "v1alpha1".to_string(),
            kind: "Application".to_string(),
            name: "myapplication".to_string(),
            namespace: "aura".to_string(),
        }
    }

    #[test]
    fn name_is_stable_per_message() {
        let a = warning_event_name("myapplication", "unknown field \"spec.foo\"");
        let b = warning_event_name("myapplication", "unknown field \"spec.foo\"");
        let c = warning_event_name("myapplication", "unknown field \"spec.bar\"");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("myapplication."));
    }

    #[test]
    fn event_references_the_applied_resource() {
        let event = warning_event(&id(), "unknown field \"spec.foo\"", "corr-1");
        assert_eq!(event["involvedObject"]["kind"], "Application");
        assert_eq!(event["metadata"]["namespace"], "aura");
        assert_eq!(
            event["metadata"]["annotations"][CORRELATION_ANNOTATION],
            "corr-1"
        );
        assert_eq!(event["reason"], "FieldValidationWarning");
    }

    #[tokio::test]
    async fn duplicate_warnings_collapse_to_one_event() {
        let events = FakeCollection::new();
        let warnings = vec!["unknown field \"spec.foo\"".to_string()];
        publish(&events, &id(), &warnings, "corr-1").await;
        publish(&events, &id(), &warnings, "corr-1").await;

        assert_eq!(events.objects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_warnings_get_distinct_events() {
        let events = FakeCollection::new();
        let warnings = vec![
            "unknown field \"spec.foo\"".to_string(),
            "unknown field \"spec.bar\"".to_string(),
        ];
        publish(&events, &id(), &warnings, "corr-1").await;
        assert_eq!(events.objects.lock().unwrap().len(), 2);
    }
}
