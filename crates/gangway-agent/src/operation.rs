//! One in-flight deployment operation.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use gangway_proto::time;
use gangway_proto::{DeploymentRequest, DeploymentStatus, PayloadError};

/// Everything a request driver and its watchers share: the request, the
/// status channel back to the dispatcher, a cancellation token, and the
/// request deadline mapped onto the tokio clock.
pub struct Operation {
    pub request: DeploymentRequest,
    pub status_tx: mpsc::Sender<DeploymentStatus>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl Operation {
    pub fn new(request: DeploymentRequest, status_tx: mpsc::Sender<DeploymentStatus>) -> Self {
        let remaining = request
            .deadline
            .as_ref()
            .and_then(time::to_datetime)
            .map(|deadline| {
                (deadline - chrono::Utc::now())
                    .to_std()
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        Operation {
            request,
            status_tx,
            cancel: CancellationToken::new(),
            deadline: Instant::now() + remaining,
        }
    }

    /// Time left until the request deadline.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn extract_resources(&self) -> Result<Vec<Value>, PayloadError> {
        self.request.resources()
    }

    /// Send a status towards the dispatcher; the receiving side going
    /// away is not this operation's problem.
    pub async fn report(&self, status: DeploymentStatus) {
        if self.status_tx.send(status).await.is_err() {
            warn!(id = %self.request.id, "status channel closed; status dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_deadline_means_already_expired() {
        let (tx, _rx) = mpsc::channel(1);
        let op = Operation::new(DeploymentRequest::default(), tx);
        assert!(op.remaining().is_zero());
    }

    #[test]
    fn future_deadline_leaves_time() {
        let (tx, _rx) = mpsc::channel(1);
        let request = DeploymentRequest {
            deadline: Some(time::from_datetime(
                chrono::Utc::now() + chrono::Duration::minutes(10),
            )),
            ..Default::default()
        };
        let op = Operation::new(request, tx);
        assert!(op.remaining() > std::time::Duration::from_secs(500));
    }
}
