//! Agent mode.
//!
//! In this mode, the daemon:
//! 1. Builds the dynamic Kubernetes client for the local cluster
//! 2. Connects to the dispatcher and registers its cluster name
//! 3. Runs one driver task per inbound deployment request
//! 4. Reconnects on a fixed interval after connection loss

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use gangway_agent::{Agent, AgentConfig, KubeClient, KubeConfig, RunnerConfig};

pub struct AgentOptions {
    pub cluster: String,
    pub dispatcher_address: String,
    pub use_tls: bool,
    pub preshared_key: Option<String>,
    pub kube_api_url: String,
    pub kube_token: Option<String>,
    pub kube_token_file: PathBuf,
    pub team_namespaces: bool,
    pub auto_create_service_account: bool,
}

pub async fn run_agent(opts: AgentOptions) -> anyhow::Result<()> {
    info!(cluster = %opts.cluster, "gangway daemon starting in agent mode");

    let token = match opts.kube_token {
        Some(token) => token,
        None => std::fs::read_to_string(&opts.kube_token_file)
            .map(|t| t.trim().to_string())
            .unwrap_or_default(),
    };
    let kube = KubeClient::new(KubeConfig {
        api_url: opts.kube_api_url,
        token,
    })?;
    info!("kubernetes client initialized");

    let dispatcher_address = if opts.dispatcher_address.contains("://") {
        opts.dispatcher_address
    } else if opts.use_tls {
        format!("https://{}", opts.dispatcher_address)
    } else {
        format!("http://{}", opts.dispatcher_address)
    };

    let mut agent_config = AgentConfig::new(&opts.cluster, &dispatcher_address);
    agent_config.preshared_key = opts.preshared_key;

    let runner_config = RunnerConfig {
        cluster: opts.cluster,
        team_namespaces: opts.team_namespaces,
        auto_create_service_account: opts.auto_create_service_account,
    };

    let agent = Agent::new(agent_config, runner_config, Arc::new(kube));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await
}
