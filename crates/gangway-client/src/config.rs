//! Client configuration and request preparation.
//!
//! The team and environment can usually be derived from the resources
//! themselves; explicit configuration always wins.

use std::time::Duration;

use serde_json::Value;
use tracing::info;

use gangway_proto::time;
use gangway_proto::{DeploymentRequest, Kubernetes, Repository};

use crate::error::{ClientError, ExitCode};

pub const RESOURCE_REQUIRED_MSG: &str =
    "at least one Kubernetes resource is required to make sense of the deployment";
pub const AUTH_REQUIRED_MSG: &str = "API key or GitHub token required";
pub const CLUSTER_REQUIRED_MSG: &str = "cluster required";
pub const MALFORMED_API_KEY_MSG: &str = "API key must be a hex encoded string";

#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatcher endpoint, e.g. `https://deploy.example.com:443`.
    pub server: String,
    /// Hex-encoded team API key.
    pub api_key: Option<String>,
    /// Repository OIDC token, used instead of the API key.
    pub github_token: Option<String>,
    pub cluster: String,
    pub team: String,
    pub environment: String,
    pub owner: String,
    pub repository: String,
    pub git_ref: String,
    pub trace_parent: Option<String>,
    pub wait: bool,
    pub retry: bool,
    pub retry_interval: Duration,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: String::new(),
            api_key: None,
            github_token: None,
            cluster: String::new(),
            team: String::new(),
            environment: String::new(),
            owner: String::new(),
            repository: String::new(),
            git_ref: String::new(),
            trace_parent: None,
            wait: false,
            retry: true,
            retry_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ClientError> {
        let invocation = |message: &str| ClientError::new(ExitCode::InvocationFailure, message);

        if self.cluster.is_empty() {
            return Err(invocation(CLUSTER_REQUIRED_MSG));
        }
        if self.api_key.is_none() && self.github_token.is_none() {
            return Err(invocation(AUTH_REQUIRED_MSG));
        }
        if let Some(key) = &self.api_key {
            if hex::decode(key).is_err() {
                return Err(invocation(MALFORMED_API_KEY_MSG));
            }
        }
        Ok(())
    }
}

/// Build the deployment request from configuration and parsed resource
/// documents, auto-detecting team and environment where unset.
pub fn prepare(config: &Config, resources: &[Value]) -> Result<DeploymentRequest, ClientError> {
    config.validate()?;

    if resources.is_empty() {
        return Err(ClientError::new(
            ExitCode::InvocationFailure,
            RESOURCE_REQUIRED_MSG,
        ));
    }

    let team = if config.team.is_empty() {
        let detected = detect_team(resources).ok_or_else(|| {
            ClientError::new(
                ExitCode::InvocationFailure,
                "no team specified, and unable to auto-detect from resources",
            )
        })?;
        info!(team = %detected, "auto-detected team");
        detected
    } else {
        config.team.clone()
    };

    let environment = if config.environment.is_empty() {
        let detected = detect_environment(&config.cluster, resources);
        info!(environment = %detected, "auto-detected environment");
        detected
    } else {
        config.environment.clone()
    };

    let raw: Result<Vec<Vec<u8>>, _> = resources.iter().map(serde_json::to_vec).collect();
    let raw = raw.map_err(|e| {
        ClientError::new(ExitCode::InternalError, format!("encode resources: {e}"))
    })?;

    let deadline = chrono::Utc::now()
        + chrono::Duration::from_std(config.timeout).unwrap_or(chrono::Duration::minutes(10));

    Ok(DeploymentRequest {
        id: String::new(),
        time: Some(time::now()),
        deadline: Some(time::from_datetime(deadline)),
        cluster: config.cluster.clone(),
        team,
        git_ref_sha: config.git_ref.clone(),
        github_environment: environment,
        repository: Some(Repository {
            owner: config.owner.clone(),
            name: config.repository.clone(),
        }),
        kubernetes: Some(Kubernetes { resources: raw }),
        trace_parent: config.trace_parent.clone().unwrap_or_default(),
    })
}

/// First non-empty `metadata.labels.team`, then the unique non-empty
/// `metadata.namespace` across all resources.
fn detect_team(resources: &[Value]) -> Option<String> {
    for resource in resources {
        if let Some(team) = resource
            .pointer("/metadata/labels/team")
            .and_then(Value::as_str)
        {
            if !team.is_empty() {
                return Some(team.to_string());
            }
        }
    }

    let namespaces = unique_namespaces(resources);
    match namespaces.as_slice() {
        [single] => Some(single.clone()),
        _ => None,
    }
}

/// `cluster:namespace` when all resources agree on one namespace,
/// otherwise just the cluster.
fn detect_environment(cluster: &str, resources: &[Value]) -> String {
    match unique_namespaces(resources).as_slice() {
        [single] => format!("{cluster}:{single}"),
        _ => cluster.to_string(),
    }
}

fn unique_namespaces(resources: &[Value]) -> Vec<String> {
    let mut namespaces: Vec<String> = resources
        .iter()
        .filter_map(|r| r.pointer("/metadata/namespace").and_then(Value::as_str))
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect();
    namespaces.sort();
    namespaces.dedup();
    namespaces
}
