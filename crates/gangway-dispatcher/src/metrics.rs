//! In-process counters for the dispatcher.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use gangway_proto::DeploymentState;

/// Dispatcher-wide operational counters.
#[derive(Default)]
pub struct Metrics {
    connected_clusters: Mutex<BTreeSet<String>>,
    statuses: [AtomicU64; 7],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_connected(&self, cluster: &str) {
        let mut clusters = self.connected_clusters.lock().expect("metrics lock");
        clusters.insert(cluster.to_string());
        info!(online = %join(&clusters), "online clusters");
    }

    pub fn cluster_disconnected(&self, cluster: &str) {
        let mut clusters = self.connected_clusters.lock().expect("metrics lock");
        clusters.remove(cluster);
        info!(online = %join(&clusters), "online clusters");
    }

    pub fn connected_clusters(&self) -> Vec<String> {
        self.connected_clusters
            .lock()
            .expect("metrics lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn observe_status(&self, state: DeploymentState) {
        self.statuses[state as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn status_count(&self, state: DeploymentState) -> u64 {
        self.statuses[state as usize].load(Ordering::Relaxed)
    }
}

fn join(clusters: &BTreeSet<String>) -> String {
    clusters.iter().cloned().collect::<Vec<_>>().join(", ")
}
