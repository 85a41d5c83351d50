//! Dispatcher mode.
//!
//! In this mode, the daemon:
//! 1. Opens the state store (deployments, statuses, API keys)
//! 2. Assembles the authenticator chain when client auth is enabled
//! 3. Serves the `Deploy` and `Dispatch` gRPC services on one port
//! 4. Prunes abandoned trace spans in the background

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use gangway_auth::{Authenticator, RepositoryAuthorizer, TeamsClient, TokenValidator};
use gangway_dispatcher::Dispatcher;
use gangway_store::{EncryptionKey, StateStore};

pub struct DispatcherOptions {
    pub listen_address: String,
    pub keepalive_interval: Duration,
    pub cli_authentication: bool,
    pub agent_authentication: bool,
    pub database_path: PathBuf,
    pub database_encryption_key: String,
    pub agent_keys: Vec<String>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
    pub oidc_jwks_url: Option<String>,
    pub teams_url: Option<String>,
}

/// Interval of the abandoned-span cleanup pass.
const SPAN_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run_dispatcher(opts: DispatcherOptions) -> anyhow::Result<()> {
    info!("gangway daemon starting in dispatcher mode");

    if let Some(parent) = opts.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encryption_key = EncryptionKey::from_hex(&opts.database_encryption_key)?;
    let store = StateStore::open(&opts.database_path, encryption_key)?;
    info!(path = ?opts.database_path, "state store opened");

    let mut dispatcher = Dispatcher::new(store.clone());

    if opts.cli_authentication {
        let token_validator = match (&opts.oidc_jwks_url, &opts.oidc_issuer, &opts.oidc_audience) {
            (Some(jwks), Some(issuer), Some(audience)) => {
                info!(%issuer, "repository token validation enabled");
                Some(TokenValidator::new(jwks, issuer, audience))
            }
            _ => None,
        };
        let authorizer = opts.teams_url.as_deref().map(|url| {
            Arc::new(TeamsClient::new(url)) as Arc<dyn RepositoryAuthorizer>
        });
        dispatcher = dispatcher.with_authenticator(Arc::new(Authenticator::new(
            store,
            token_validator,
            authorizer,
        )));
        info!("client authentication enabled");
    }

    if opts.agent_authentication {
        anyhow::ensure!(
            !opts.agent_keys.is_empty(),
            "agent authentication enabled but no agent keys configured"
        );
        dispatcher = dispatcher.with_agent_keys(opts.agent_keys);
        info!("agent authentication enabled");
    }

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prune_dispatcher = dispatcher.clone();
    let prune_handle = tokio::spawn(async move {
        prune_dispatcher
            .spans()
            .run(SPAN_PRUNE_INTERVAL, shutdown_rx)
            .await;
    });

    // ── gRPC server ──────────────────────────────────────────────
    let addr: SocketAddr = opts.listen_address.parse()?;
    info!(%addr, "dispatcher gRPC server starting");

    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(opts.keepalive_interval))
        .add_service(dispatcher.deploy_service())
        .add_service(dispatcher.dispatch_service())
        .serve_with_shutdown(addr, async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = prune_handle.await;
    info!("dispatcher stopped");
    Ok(())
}
