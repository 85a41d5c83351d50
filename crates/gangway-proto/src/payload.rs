//! Resource payload decoding.
//!
//! The resources inside a [`DeploymentRequest`] are opaque JSON documents;
//! the dispatcher only needs their identifiers for the audit trail while
//! the agent needs the full documents for the apply engine.

use std::fmt;

use serde_json::Value;

use crate::proto::DeploymentRequest;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("resource {index}: decoding payload: {source}")]
    Decode {
        index: usize,
        source: serde_json::Error,
    },

    #[error("no resources to deploy")]
    Empty,
}

/// The `{group, version, kind, namespace, name}` identifier of one
/// resource in a request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceId {
    /// Extract the identifier from a Kubernetes manifest.
    pub fn from_document(doc: &Value) -> Self {
        let api_version = doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let meta = doc.get("metadata");
        let field = |key: &str| {
            meta.and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        ResourceId {
            group,
            version,
            kind: doc
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: field("name"),
            namespace: field("namespace"),
        }
    }

    /// `group/version` for grouped resources, bare `version` for core.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)?;
        if !self.namespace.is_empty() {
            write!(f, " in namespace {}", self.namespace)?;
        }
        Ok(())
    }
}

impl DeploymentRequest {
    /// Decode the raw resource documents, in submission order.
    ///
    /// Fails with [`PayloadError::Empty`] when the request carries no
    /// resources at all.
    pub fn resources(&self) -> Result<Vec<Value>, PayloadError> {
        let raw = self
            .kubernetes
            .as_ref()
            .map(|k| k.resources.as_slice())
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(PayloadError::Empty);
        }

        raw.iter()
            .enumerate()
            .map(|(index, bytes)| {
                serde_json::from_slice(bytes).map_err(|source| PayloadError::Decode {
                    index: index + 1,
                    source,
                })
            })
            .collect()
    }

    /// Identifiers of all resources, in submission order.
    pub fn resource_ids(&self) -> Result<Vec<ResourceId>, PayloadError> {
        Ok(self.resources()?.iter().map(ResourceId::from_document).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Kubernetes;
    use serde_json::json;

    fn request_with(docs: Vec<Value>) -> DeploymentRequest {
        DeploymentRequest {
            kubernetes: Some(Kubernetes {
                resources: docs
                    .into_iter()
                    .map(|d| serde_json::to_vec(&d).unwrap())
                    .collect(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_in_submission_order() {
        let req = request_with(vec![
            json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"name": "a"}}),
            json!({"kind": "Secret", "apiVersion": "v1", "metadata": {"name": "b"}}),
        ]);
        let resources = req.resources().unwrap();
        assert_eq!(resources[0]["metadata"]["name"], "a");
        assert_eq!(resources[1]["metadata"]["name"], "b");
    }

    #[test]
    fn empty_payload_is_an_error() {
        let req = DeploymentRequest::default();
        assert!(matches!(req.resources(), Err(PayloadError::Empty)));
    }

    #[test]
    fn malformed_document_names_its_index() {
        let mut req = request_with(vec![json!({"kind": "ConfigMap"})]);
        req.kubernetes.as_mut().unwrap().resources.push(b"{oops".to_vec());
        let err = req.resources().unwrap_err();
        assert!(err.to_string().starts_with("resource 2:"));
    }

    #[test]
    fn identifier_from_grouped_resource() {
        let id = ResourceId::from_document(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "myapp", "namespace": "aura"},
        }));
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");
        assert_eq!(id.api_version(), "apps/v1");
        assert_eq!(id.to_string(), "Deployment/myapp in namespace aura");
    }

    #[test]
    fn identifier_from_core_resource() {
        let id = ResourceId::from_document(&json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "aura"},
        }));
        assert_eq!(id.group, "");
        assert_eq!(id.api_version(), "v1");
        assert_eq!(id.to_string(), "Namespace/aura");
    }
}
