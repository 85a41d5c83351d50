//! REST mapping via the discovery document.
//!
//! A `{group, version, kind}` triple maps to a resource plural and scope
//! by asking the API server for the group-version's resource list
//! (`/api/v1` for the core group, `/apis/{group}/{version}` otherwise).

use serde::Deserialize;
use serde_json::Value;

use gangway_proto::ResourceId;

use super::KubeError;

/// Where and how a kind's collection is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    /// `api/v1` or `apis/{group}/{version}`.
    pub group_version_path: String,
    /// Lowercase plural, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
}

impl RestMapping {
    /// Collection URL under `base`, namespaced when both the mapping and
    /// the resource call for it.
    pub fn collection_url(&self, base: &str, namespace: &str) -> String {
        if self.namespaced && !namespace.is_empty() {
            format!(
                "{base}/{}/namespaces/{namespace}/{}",
                self.group_version_path, self.plural
            )
        } else {
            format!("{base}/{}/{}", self.group_version_path, self.plural)
        }
    }
}

/// Path of the discovery document for a resource's group-version.
pub fn group_version_path(id: &ResourceId) -> String {
    if id.group.is_empty() {
        format!("api/{}", id.version)
    } else {
        format!("apis/{}/{}", id.group, id.version)
    }
}

#[derive(Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResource>,
}

#[derive(Deserialize)]
struct ApiResource {
    name: String,
    kind: String,
    namespaced: bool,
}

/// Find the mapping for `id` in a discovery document.
pub fn mapping_from_discovery(id: &ResourceId, discovery: &Value) -> Result<RestMapping, KubeError> {
    let list: ApiResourceList = serde_json::from_value(discovery.clone())
        .map_err(|e| KubeError::Discovery(format!("malformed discovery document: {e}")))?;

    list.resources
        .iter()
        // Subresources come as `pods/status`; only collections count.
        .filter(|r| !r.name.contains('/'))
        .find(|r| r.kind == id.kind)
        .map(|r| RestMapping {
            group_version_path: group_version_path(id),
            plural: r.name.clone(),
            namespaced: r.namespaced,
        })
        .ok_or_else(|| {
            KubeError::Discovery(format!(
                "no resource mapping for kind {} in {}",
                id.kind,
                id.api_version()
            ))
        })
}
