//! Per-cluster request routing.
//!
//! The registry of `cluster → outbound channel` is the dispatcher's
//! central shared state. The lock is held only across map operations,
//! never across channel sends.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

use gangway_proto::DeploymentRequest;

/// Outbound per-cluster queue depth; producers block when it fills.
pub const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// How long admission may wait on a saturated agent before giving up.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("cluster already connected: {0}")]
    AlreadyConnected(String),

    #[error("cluster '{0}' is offline")]
    Offline(String),

    #[error("cluster '{0}' is not consuming deployment requests")]
    Saturated(String),
}

/// Routes deployment requests to the single connected agent per cluster.
pub struct ClusterRouter {
    streams: RwLock<HashMap<String, mpsc::Sender<DeploymentRequest>>>,
    send_timeout: Duration,
}

impl ClusterRouter {
    pub fn new() -> Self {
        ClusterRouter {
            streams: RwLock::new(HashMap::new()),
            send_timeout: SEND_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_send_timeout(timeout: Duration) -> Self {
        ClusterRouter {
            streams: RwLock::new(HashMap::new()),
            send_timeout: timeout,
        }
    }

    /// Register the agent stream for a cluster.
    ///
    /// At most one stream per cluster: a second registration is refused
    /// until the first one is unregistered.
    pub async fn register(
        &self,
        cluster: &str,
    ) -> Result<mpsc::Receiver<DeploymentRequest>, RouterError> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(cluster) {
            warn!(%cluster, "rejected connection: already connected");
            return Err(RouterError::AlreadyConnected(cluster.to_string()));
        }
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        streams.insert(cluster.to_string(), tx);
        info!(%cluster, "connection opened");
        Ok(rx)
    }

    /// Drop the registration for a cluster, if any.
    pub async fn unregister(&self, cluster: &str) {
        let mut streams = self.streams.write().await;
        if streams.remove(cluster).is_some() {
            warn!(%cluster, "connection closed");
        }
    }

    pub async fn is_online(&self, cluster: &str) -> bool {
        self.streams.read().await.contains_key(cluster)
    }

    pub async fn online_clusters(&self) -> Vec<String> {
        let mut clusters: Vec<String> = self.streams.read().await.keys().cloned().collect();
        clusters.sort();
        clusters
    }

    /// Push a request onto the target cluster's stream.
    ///
    /// Applies backpressure up to the configured timeout; a persistently
    /// slow agent surfaces as [`RouterError::Saturated`].
    pub async fn send(&self, request: DeploymentRequest) -> Result<(), RouterError> {
        let cluster = request.cluster.clone();
        let sender = {
            let streams = self.streams.read().await;
            streams.get(&cluster).cloned()
        };
        let Some(sender) = sender else {
            return Err(RouterError::Offline(cluster));
        };

        match sender.send_timeout(request, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(RouterError::Saturated(cluster))
            }
            // Receiver dropped between lookup and send.
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(RouterError::Offline(cluster)),
        }
    }
}

impl Default for ClusterRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cluster: &str) -> DeploymentRequest {
        DeploymentRequest {
            cluster: cluster.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_and_route() {
        let router = ClusterRouter::new();
        let mut rx = router.register("dev").await.unwrap();

        assert!(router.is_online("dev").await);
        router.send(request("dev")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().cluster, "dev");
    }

    #[tokio::test]
    async fn second_registration_is_refused() {
        let router = ClusterRouter::new();
        let _rx = router.register("dev").await.unwrap();
        assert!(matches!(
            router.register("dev").await,
            Err(RouterError::AlreadyConnected(_))
        ));

        // After the first unregisters, a new agent may take over.
        router.unregister("dev").await;
        assert!(router.register("dev").await.is_ok());
    }

    #[tokio::test]
    async fn offline_cluster_is_an_error() {
        let router = ClusterRouter::new();
        assert!(matches!(
            router.send(request("nowhere")).await,
            Err(RouterError::Offline(_))
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_offline() {
        let router = ClusterRouter::new();
        let rx = router.register("dev").await.unwrap();
        drop(rx);
        assert!(matches!(
            router.send(request("dev")).await,
            Err(RouterError::Offline(_))
        ));
    }

    #[tokio::test]
    async fn saturated_agent_times_out() {
        let router = ClusterRouter::with_send_timeout(Duration::from_millis(10));
        let _rx = router.register("dev").await.unwrap();

        // Fill the channel without consuming.
        for _ in 0..REQUEST_CHANNEL_CAPACITY {
            router.send(request("dev")).await.unwrap();
        }
        assert!(matches!(
            router.send(request("dev")).await,
            Err(RouterError::Saturated(_))
        ));
    }

    #[tokio::test]
    async fn online_clusters_sorted() {
        let router = ClusterRouter::new();
        let _a = router.register("prod").await.unwrap();
        let _b = router.register("dev").await.unwrap();
        assert_eq!(router.online_clusters().await, vec!["dev", "prod"]);
    }
}
