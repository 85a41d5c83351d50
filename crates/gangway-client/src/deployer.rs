//! The deploy-and-wait loop.
//!
//! `unavailable` and `internal` are retried at a fixed interval while
//! the overall timeout allows; an `inactive` status means the dispatcher
//! lost the deployment, so the original request is resubmitted and the
//! status stream re-opened under the new correlation ID. The server
//! never replays history on a fresh subscription, so absence of news is
//! treated as "still in progress".

use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use gangway_proto::proto::deploy_client::DeployClient;
use gangway_proto::{DeploymentRequest, DeploymentState, DeploymentStatus};

use crate::config::Config;
use crate::credentials::Credentials;
use crate::error::{ClientError, ExitCode, format_grpc_error, retriable, status_error};

pub struct Deployer {
    client: DeployClient<Channel>,
    config: Config,
    credentials: Credentials,
}

impl Deployer {
    /// Dial the dispatcher and prepare credentials.
    pub async fn connect(config: Config) -> Result<Self, ClientError> {
        let credentials = config.credentials()?;
        let endpoint = Endpoint::from_shared(config.server.clone())
            .map_err(|e| ClientError::new(ExitCode::InvocationFailure, e.to_string()))?
            .connect_timeout(std::time::Duration::from_secs(5));
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientError::new(ExitCode::Unavailable, e.to_string()))?;
        Ok(Deployer {
            client: DeployClient::new(channel),
            config,
            credentials,
        })
    }

    /// Send the request; when `wait` is configured, follow the status
    /// stream to its terminal state and map it to the exit contract.
    pub async fn deploy(&mut self, mut request: DeploymentRequest) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.config.timeout;

        let status = self.send_request(&mut request, deadline).await?;
        log_status(&status);
        if status.state().is_finished() {
            return status_error(&status);
        }
        if !self.config.wait {
            return Ok(());
        }

        info!("waiting for deployment to complete");
        self.wait_for_completion(request, deadline).await
    }

    fn signed<T>(&self, message: T, team: &str) -> Result<tonic::Request<T>, ClientError> {
        let mut request = tonic::Request::new(message);
        self.credentials.attach(&mut request, team)?;
        Ok(request)
    }

    /// Submit with retry; adopts the server-minted correlation ID.
    async fn send_request(
        &mut self,
        request: &mut DeploymentRequest,
        deadline: Instant,
    ) -> Result<DeploymentStatus, ClientError> {
        let status = loop {
            let signed = self.signed(request.clone(), &request.team)?;
            match self.client.deploy(signed).await {
                Ok(response) => break response.into_inner(),
                Err(status) => {
                    if self.config.retry && retriable(status.code()) && Instant::now() < deadline {
                        warn!(
                            "{} (retrying in {:?})",
                            format_grpc_error(&status),
                            self.config.retry_interval
                        );
                        tokio::time::sleep(self.config.retry_interval).await;
                        continue;
                    }
                    if status.code() == tonic::Code::DeadlineExceeded {
                        return Err(ClientError::new(ExitCode::Timeout, "deployment timed out"));
                    }
                    return Err(ClientError::new(
                        ExitCode::NoDeployment,
                        format_grpc_error(&status),
                    ));
                }
            }
        };

        if let Some(accepted) = &status.request {
            request.id = accepted.id.clone();
        }
        info!(
            id = %request.id,
            cluster = %request.cluster,
            "deployment request accepted and dispatched"
        );
        Ok(status)
    }

    async fn wait_for_completion(
        &mut self,
        mut request: DeploymentRequest,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        loop {
            if Instant::now() >= deadline {
                return Err(ClientError::new(ExitCode::Timeout, "deployment timed out"));
            }

            // (Re)subscribe; only new statuses arrive, never history.
            let mut stream = loop {
                let signed = self.signed(request.clone(), &request.team)?;
                match self.client.status(signed).await {
                    Ok(response) => break response.into_inner(),
                    Err(status) => {
                        if self.config.retry
                            && retriable(status.code())
                            && Instant::now() < deadline
                        {
                            warn!(
                                "{} (retrying in {:?})",
                                format_grpc_error(&status),
                                self.config.retry_interval
                            );
                            tokio::time::sleep(self.config.retry_interval).await;
                            continue;
                        }
                        return Err(ClientError::new(
                            ExitCode::Unavailable,
                            format_grpc_error(&status),
                        ));
                    }
                }
            };

            loop {
                let next = tokio::time::timeout_at(deadline, stream.message()).await;
                match next {
                    Err(_elapsed) => {
                        return Err(ClientError::new(ExitCode::Timeout, "deployment timed out"));
                    }
                    Ok(Err(status)) => {
                        if self.config.retry && retriable(status.code()) {
                            warn!("connection lost: {}", format_grpc_error(&status));
                            break;
                        }
                        return Err(ClientError::new(
                            ExitCode::Unavailable,
                            format_grpc_error(&status),
                        ));
                    }
                    // Server closed the stream without a terminal status;
                    // resubscribe and keep waiting.
                    Ok(Ok(None)) => {
                        warn!("status stream ended; re-subscribing");
                        break;
                    }
                    Ok(Ok(Some(status))) => {
                        log_status(&status);
                        if status.state() == DeploymentState::Inactive {
                            warn!("deployment server lost the deployment; re-sending request");
                            request.id = String::new();
                            let resent = self.send_request(&mut request, deadline).await?;
                            log_status(&resent);
                            if resent.state().is_finished() {
                                return status_error(&resent);
                            }
                            // New correlation ID, new subscription.
                            break;
                        }
                        if status.state().is_finished() {
                            return status_error(&status);
                        }
                    }
                }
            }
        }
    }
}

fn log_status(status: &DeploymentStatus) {
    let state = status.state();
    if state.is_error() {
        warn!(%state, message = %status.message, "deployment status");
    } else {
        info!(%state, message = %status.message, "deployment status");
    }
}
