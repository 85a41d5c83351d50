//! Apply strategies.
//!
//! The strategy is picked by kind: `batch/v1` Jobs are immutable once
//! created, so they are deleted and recreated; everything else merges by
//! name via create-or-update. Both strategies are idempotent under
//! resubmission of an unchanged request.

use serde_json::Value;

use gangway_proto::ResourceId;

use super::{ApplyOutcome, DynamicResource, KubeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStrategy {
    CreateOrUpdate,
    Recreate,
}

pub fn strategy_for(id: &ResourceId) -> ApplyStrategy {
    if id.group == "batch" && id.version == "v1" && id.kind == "Job" {
        ApplyStrategy::Recreate
    } else {
        ApplyStrategy::CreateOrUpdate
    }
}

/// Apply one resource with the given strategy.
pub async fn apply(
    strategy: ApplyStrategy,
    handle: &dyn DynamicResource,
    resource: &Value,
) -> Result<ApplyOutcome, KubeError> {
    match strategy {
        ApplyStrategy::CreateOrUpdate => create_or_update(handle, resource).await,
        ApplyStrategy::Recreate => recreate(handle, resource).await,
    }
}

fn resource_name(resource: &Value) -> Result<&str, KubeError> {
    resource
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| KubeError::Api("resource has no metadata.name".to_string()))
}

async fn create_or_update(
    handle: &dyn DynamicResource,
    resource: &Value,
) -> Result<ApplyOutcome, KubeError> {
    let name = resource_name(resource)?;
    match handle.get(name).await {
        Err(KubeError::NotFound) => handle.create(resource).await,
        Err(e) => Err(KubeError::Api(format!("get existing resource: {e}"))),
        Ok(existing) => {
            // Updates must carry the resourceVersion of the object they
            // replace, or the API server rejects them as conflicts.
            let mut updated = resource.clone();
            if let Some(version) = existing.pointer("/metadata/resourceVersion").cloned() {
                if let Some(metadata) =
                    updated.pointer_mut("/metadata").and_then(Value::as_object_mut)
                {
                    metadata.insert("resourceVersion".to_string(), version);
                }
            }
            handle.update(&updated).await
        }
    }
}

async fn recreate(
    handle: &dyn DynamicResource,
    resource: &Value,
) -> Result<ApplyOutcome, KubeError> {
    let name = resource_name(resource)?;
    match handle.delete(name).await {
        Ok(()) | Err(KubeError::NotFound) => {}
        Err(e) => return Err(e),
    }
    handle.create(resource).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every call and keeps objects in a map, assigning an
    /// incrementing resourceVersion like a real API server.
    pub struct FakeCollection {
        pub objects: Mutex<HashMap<String, Value>>,
        pub calls: Mutex<Vec<String>>,
        version: Mutex<u64>,
    }

    impl FakeCollection {
        pub fn new() -> Self {
            FakeCollection {
                objects: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                version: Mutex::new(0),
            }
        }

        pub fn with_object(self, object: Value) -> Self {
            let name = object["metadata"]["name"].as_str().unwrap().to_string();
            self.objects.lock().unwrap().insert(name, object);
            self
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn next_version(&self) -> String {
            let mut version = self.version.lock().unwrap();
            *version += 1;
            version.to_string()
        }
    }

    #[async_trait]
    impl DynamicResource for FakeCollection {
        async fn get(&self, name: &str) -> Result<Value, KubeError> {
            self.log(format!("get {name}"));
            self.objects
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or(KubeError::NotFound)
        }

        async fn create(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
            let name = object["metadata"]["name"].as_str().unwrap().to_string();
            self.log(format!("create {name}"));
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&name) {
                return Err(KubeError::Api(format!("{name} already exists")));
            }
            let mut stored = object.clone();
            stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
            objects.insert(name, stored.clone());
            Ok(ApplyOutcome {
                object: stored,
                warnings: vec![],
            })
        }

        async fn update(&self, object: &Value) -> Result<ApplyOutcome, KubeError> {
            let name = object["metadata"]["name"].as_str().unwrap().to_string();
            self.log(format!("update {name}"));
            let mut objects = self.objects.lock().unwrap();
            let existing = objects.get(&name).ok_or(KubeError::NotFound)?;
            if object["metadata"]["resourceVersion"] != existing["metadata"]["resourceVersion"] {
                return Err(KubeError::Api("resourceVersion conflict".to_string()));
            }
            let mut stored = object.clone();
            stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
            objects.insert(name, stored.clone());
            Ok(ApplyOutcome {
                object: stored,
                warnings: vec![],
            })
        }

        async fn delete(&self, name: &str) -> Result<(), KubeError> {
            self.log(format!("delete {name}"));
            self.objects
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or(KubeError::NotFound)
        }
    }

    fn configmap(data: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "foo", "namespace": "aura"},
            "data": {"value": data},
        })
    }

    fn job() -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "aura"},
        })
    }

    #[test]
    fn strategy_selection() {
        let job_id = ResourceId::from_document(&job());
        assert_eq!(strategy_for(&job_id), ApplyStrategy::Recreate);

        let configmap_id = ResourceId::from_document(&configmap("x"));
        assert_eq!(strategy_for(&configmap_id), ApplyStrategy::CreateOrUpdate);

        // Jobs outside batch/v1 are not recreated.
        let cron_id = ResourceId {
            group: "batch".to_string(),
            version: "v1beta1".to_string(),
            kind: "Job".to_string(),
            name: "x".to_string(),
            namespace: "ns".to_string(),
        };
        assert_eq!(strategy_for(&cron_id), ApplyStrategy::CreateOrUpdate);
    }

    #[tokio::test]
    async fn create_when_absent() {
        let fake = FakeCollection::new();
        apply(ApplyStrategy::CreateOrUpdate, &fake, &configmap("a"))
            .await
            .unwrap();
        assert_eq!(
            *fake.calls.lock().unwrap(),
            vec!["get foo", "create foo"]
        );
    }

    #[tokio::test]
    async fn update_when_present_carries_resource_version() {
        let fake = FakeCollection::new();
        apply(ApplyStrategy::CreateOrUpdate, &fake, &configmap("a"))
            .await
            .unwrap();
        let outcome = apply(ApplyStrategy::CreateOrUpdate, &fake, &configmap("b"))
            .await
            .unwrap();

        assert_eq!(outcome.object["data"]["value"], "b");
        assert!(
            fake.calls
                .lock()
                .unwrap()
                .contains(&"update foo".to_string())
        );
        // Exactly one object remains.
        assert_eq!(fake.objects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn double_apply_is_idempotent() {
        let fake = FakeCollection::new();
        apply(ApplyStrategy::CreateOrUpdate, &fake, &configmap("same"))
            .await
            .unwrap();
        let second = apply(ApplyStrategy::CreateOrUpdate, &fake, &configmap("same"))
            .await
            .unwrap();

        let objects = fake.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects["foo"]["data"]["value"], "same");
        assert_eq!(second.object["data"]["value"], "same");
    }

    #[tokio::test]
    async fn recreate_tolerates_absent_object() {
        let fake = FakeCollection::new();
        apply(ApplyStrategy::Recreate, &fake, &job()).await.unwrap();
        assert_eq!(
            *fake.calls.lock().unwrap(),
            vec!["delete migrate", "create migrate"]
        );
    }

    #[tokio::test]
    async fn recreate_replaces_existing_job() {
        let fake = FakeCollection::new();
        apply(ApplyStrategy::Recreate, &fake, &job()).await.unwrap();

        let mut second = job();
        second["spec"] = json!({"backoffLimit": 3});
        apply(ApplyStrategy::Recreate, &fake, &second).await.unwrap();

        let objects = fake.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects["migrate"]["spec"]["backoffLimit"], 3);
    }

    #[tokio::test]
    async fn get_failure_aborts_with_context() {
        struct Failing;
        #[async_trait]
        impl DynamicResource for Failing {
            async fn get(&self, _name: &str) -> Result<Value, KubeError> {
                Err(KubeError::Api(
                    "configmaps \"foo\" is forbidden: User \"system:serviceaccount:aura:serviceuser-aura\" cannot get resource \"configmaps\"".to_string(),
                ))
            }
            async fn create(&self, _object: &Value) -> Result<ApplyOutcome, KubeError> {
                unreachable!()
            }
            async fn update(&self, _object: &Value) -> Result<ApplyOutcome, KubeError> {
                unreachable!()
            }
            async fn delete(&self, _name: &str) -> Result<(), KubeError> {
                unreachable!()
            }
        }

        let err = apply(ApplyStrategy::CreateOrUpdate, &Failing, &configmap("a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is forbidden: User"));
    }
}
