//! Status fan-out to waiting clients.
//!
//! Modeled as "register a channel, receive copies until deregistered";
//! each subscriber filters by request ID on its own side. Buffers are
//! sized generously so a briefly slow consumer never loses a status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use gangway_proto::DeploymentStatus;

/// Per-subscriber buffer depth.
pub const SUBSCRIPTION_BUFFER: usize = 4096;

/// Copies every inbound agent status to all registered subscribers.
pub struct StatusFanout {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<DeploymentStatus>>>,
    next_id: AtomicU64,
}

impl StatusFanout {
    pub fn new() -> Self {
        StatusFanout {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber; returns its handle and receive side.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<DeploymentStatus>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.write().await.insert(id, tx);
        debug!(subscriber = id, "status subscription opened");
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!(subscriber = id, "status subscription closed");
        }
    }

    /// Deliver a copy of the status to every subscriber.
    ///
    /// The lock is released before any send; a subscriber whose receive
    /// side is gone is skipped (it unsubscribes itself on exit).
    pub async fn broadcast(&self, status: &DeploymentStatus) {
        let senders: Vec<(u64, mpsc::Sender<DeploymentStatus>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        for (id, tx) in senders {
            if tx.send(status.clone()).await.is_err() {
                debug!(subscriber = id, "subscriber gone; status not delivered");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for StatusFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_proto::{DeploymentRequest, DeploymentState};

    fn status(id: &str) -> DeploymentStatus {
        let request = DeploymentRequest {
            id: id.to_string(),
            ..Default::default()
        };
        DeploymentStatus::in_progress(&request, "working")
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let fanout = StatusFanout::new();
        let (_a, mut rx_a) = fanout.subscribe().await;
        let (_b, mut rx_b) = fanout.subscribe().await;

        fanout.broadcast(&status("d1")).await;

        assert_eq!(rx_a.recv().await.unwrap().request_id(), "d1");
        assert_eq!(rx_b.recv().await.unwrap().request_id(), "d1");
    }

    #[tokio::test]
    async fn unsubscribed_channel_stops_receiving() {
        let fanout = StatusFanout::new();
        let (id, mut rx) = fanout.subscribe().await;

        fanout.broadcast(&status("d1")).await;
        assert!(rx.recv().await.is_some());

        fanout.unsubscribe(id).await;
        assert_eq!(fanout.subscriber_count().await, 0);
        fanout.broadcast(&status("d2")).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_broadcast() {
        let fanout = StatusFanout::new();
        let (_dead, rx_dead) = fanout.subscribe().await;
        drop(rx_dead);
        let (_live, mut rx_live) = fanout.subscribe().await;

        fanout.broadcast(&status("d1")).await;
        let received = rx_live.recv().await.unwrap();
        assert_eq!(received.state(), DeploymentState::InProgress);
    }

    #[tokio::test]
    async fn ordering_preserved_per_subscriber() {
        let fanout = StatusFanout::new();
        let (_id, mut rx) = fanout.subscribe().await;

        for i in 0..10 {
            fanout.broadcast(&status(&format!("d{i}"))).await;
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().request_id(), format!("d{i}"));
        }
    }
}
