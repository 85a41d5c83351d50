//! Dispatcher transport.
//!
//! Maintains the single long-lived `Deployments` stream to the
//! dispatcher, spawns one driver task per inbound request, and reports
//! statuses back over `ReportStatus`. The connection is re-dialed on a
//! fixed interval after any failure; the startup time sent with each
//! (re)connection lets the dispatcher invalidate deployments this agent
//! no longer knows about.

use std::sync::Arc;
use std::time::Duration;

use prost_types::Timestamp;
use tokio::sync::{mpsc, watch};
use tonic::transport::{Channel, Endpoint};
use tracing::{Instrument, info, info_span, warn};

use gangway_proto::proto::dispatch_client::DispatchClient;
use gangway_proto::time;
use gangway_proto::{AgentConnectOpts, DeploymentRequest, DeploymentStatus};

use crate::kube::TeamClientProvider;
use crate::operation::Operation;
use crate::runner::{self, RunnerConfig};

/// Configuration for the dispatcher connection.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cluster this agent serves; sent on connect and used to vet
    /// inbound requests.
    pub cluster: String,
    /// Dispatcher gRPC endpoint, e.g. `https://deploy.example.com:443`.
    pub dispatcher_address: String,
    /// Pre-shared key presented on every agent RPC.
    pub preshared_key: Option<String>,
    /// Pause between reconnection attempts.
    pub reconnect_interval: Duration,
    /// HTTP/2 keepalive so dead connections are detected promptly.
    pub keepalive_interval: Duration,
}

impl AgentConfig {
    pub fn new(cluster: &str, dispatcher_address: &str) -> Self {
        AgentConfig {
            cluster: cluster.to_string(),
            dispatcher_address: dispatcher_address.to_string(),
            preshared_key: None,
            reconnect_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

/// The agent process: one dispatcher connection, many driver tasks.
pub struct Agent {
    config: AgentConfig,
    runner_config: RunnerConfig,
    provider: Arc<dyn TeamClientProvider>,
    startup_time: Timestamp,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        runner_config: RunnerConfig,
        provider: Arc<dyn TeamClientProvider>,
    ) -> Self {
        Agent {
            config,
            runner_config,
            provider,
            startup_time: time::now(),
        }
    }

    /// Connect-and-serve loop; returns when the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.serve(&mut shutdown).await {
                Ok(()) => {
                    info!("dispatcher stream closed");
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dispatcher connection lost"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("agent stopped");
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<Channel> {
        let endpoint = Endpoint::from_shared(self.config.dispatcher_address.clone())?
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_while_idle(true)
            .connect_timeout(Duration::from_secs(5));
        Ok(endpoint.connect().await?)
    }

    async fn serve(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let channel = self.connect().await?;
        let mut client = DispatchClient::new(channel.clone());

        let mut request = tonic::Request::new(AgentConnectOpts {
            cluster: self.config.cluster.clone(),
            startup_time: Some(self.startup_time.clone()),
        });
        self.attach_credentials(&mut request)?;

        let mut stream = client.deployments(request).await?.into_inner();
        info!(cluster = %self.config.cluster, "connected to dispatcher; awaiting deployment requests");

        loop {
            tokio::select! {
                message = stream.message() => match message? {
                    Some(deployment) => self.spawn_driver(channel.clone(), deployment),
                    None => return Ok(()),
                },
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn attach_credentials<T>(&self, request: &mut tonic::Request<T>) -> anyhow::Result<()> {
        if let Some(key) = &self.config.preshared_key {
            request.metadata_mut().insert("authorization", key.parse()?);
        }
        Ok(())
    }

    /// One driver task plus a streamer that forwards its statuses.
    fn spawn_driver(&self, channel: Channel, request: DeploymentRequest) {
        let span = info_span!("deployment", id = %request.id, team = %request.team);
        let (status_tx, status_rx) = mpsc::channel(16);
        let op = Operation::new(request.clone(), status_tx);

        let provider = self.provider.clone();
        let runner_config = self.runner_config.clone();
        let preshared_key = self.config.preshared_key.clone();

        tokio::spawn(
            async move {
                let driver = tokio::spawn(
                    runner::run(op, provider, runner_config).in_current_span(),
                );
                stream_statuses(channel, preshared_key, &request, status_rx).await;
                if let Err(e) = driver.await {
                    warn!(error = %e, "deployment driver task failed");
                }
            }
            .instrument(span),
        );
    }
}

/// Forward statuses to the dispatcher until the driver is done; if the
/// driver never produced a terminal status, synthesize one so the
/// fan-out chain terminates cleanly.
async fn stream_statuses(
    channel: Channel,
    preshared_key: Option<String>,
    request: &DeploymentRequest,
    mut status_rx: mpsc::Receiver<DeploymentStatus>,
) {
    let mut client = DispatchClient::new(channel);
    let mut terminal_reported = false;

    while let Some(status) = status_rx.recv().await {
        if status.state().is_finished() {
            terminal_reported = true;
        }
        report(&mut client, &preshared_key, status).await;
    }

    if !terminal_reported {
        warn!(id = %request.id, "driver ended without a terminal status");
        report(
            &mut client,
            &preshared_key,
            DeploymentStatus::error(request, "deployment ended without a terminal status"),
        )
        .await;
    }
}

async fn report(
    client: &mut DispatchClient<Channel>,
    preshared_key: &Option<String>,
    status: DeploymentStatus,
) {
    let mut request = tonic::Request::new(status);
    if let Some(key) = preshared_key {
        match key.parse() {
            Ok(value) => {
                request.metadata_mut().insert("authorization", value);
            }
            Err(e) => warn!(error = %e, "pre-shared key is not valid metadata"),
        }
    }
    if let Err(e) = client.report_status(request).await {
        warn!(error = %e, "unable to report deployment status");
    }
}
