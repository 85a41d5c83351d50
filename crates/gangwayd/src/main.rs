//! gangwayd — the Gangway daemon.
//!
//! One binary, two long-running modes plus one admin task:
//! - `dispatcher`: the central hub CI clients and cluster agents talk to
//! - `agent`: the per-cluster worker applying deployments to Kubernetes
//! - `rotate-apikey`: provision or rotate a team's API key in the store
//!
//! # Usage
//!
//! ```text
//! gangwayd dispatcher --listen-address 0.0.0.0:9090 --database-path /var/lib/gangway/gangway.redb
//! gangwayd agent --cluster dev --dispatcher-address deploy.example.com:443 --use-tls
//! gangwayd rotate-apikey --team aura --database-path /var/lib/gangway/gangway.redb
//! ```

mod agent_mode;
mod dispatcher_mode;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing::info;

use gangway_store::{EncryptionKey, StateStore};

#[derive(Parser)]
#[command(name = "gangwayd", about = "Gangway deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central dispatcher.
    Dispatcher {
        /// gRPC listen address.
        #[arg(long, default_value = "0.0.0.0:9090")]
        listen_address: String,

        /// HTTP/2 keepalive ping interval in seconds.
        #[arg(long, default_value = "15")]
        keepalive_interval: u64,

        /// Require CI client credentials on Deploy/Status.
        #[arg(long)]
        cli_authentication: bool,

        /// Require agent pre-shared keys on agent RPCs.
        #[arg(long)]
        agent_authentication: bool,

        /// Path of the state database.
        #[arg(long, default_value = "/var/lib/gangway/gangway.redb")]
        database_path: PathBuf,

        /// Hex-encoded 32-byte key encrypting API keys at rest.
        #[arg(long, env = "GANGWAY_DATABASE_ENCRYPTION_KEY")]
        database_encryption_key: String,

        /// Accepted agent pre-shared keys (repeatable).
        #[arg(long = "agent-key")]
        agent_keys: Vec<String>,

        /// OIDC issuer for repository tokens.
        #[arg(long)]
        oidc_issuer: Option<String>,

        /// OIDC audience for repository tokens.
        #[arg(long)]
        oidc_audience: Option<String>,

        /// JWKS endpoint of the identity provider.
        #[arg(long)]
        oidc_jwks_url: Option<String>,

        /// Base URL of the team-ownership service.
        #[arg(long)]
        teams_url: Option<String>,
    },

    /// Run the cluster agent.
    Agent {
        /// Name of the cluster this agent serves.
        #[arg(long)]
        cluster: String,

        /// Dispatcher gRPC endpoint (host:port).
        #[arg(long)]
        dispatcher_address: String,

        /// Dial the dispatcher over TLS.
        #[arg(long)]
        use_tls: bool,

        /// Pre-shared key presented to the dispatcher.
        #[arg(long, env = "GANGWAY_PRESHARED_KEY")]
        preshared_key: Option<String>,

        /// Kubernetes API server URL.
        #[arg(long, default_value = "https://kubernetes.default.svc")]
        kube_api_url: String,

        /// Bearer token for the API server.
        #[arg(long, env = "GANGWAY_KUBE_TOKEN")]
        kube_token: Option<String>,

        /// File containing the bearer token (in-cluster service account).
        #[arg(
            long,
            default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
        )]
        kube_token_file: PathBuf,

        /// Impersonate team service accounts in their own namespaces.
        #[arg(long)]
        team_namespaces: bool,

        /// Create missing team service accounts on demand.
        #[arg(long)]
        auto_create_service_account: bool,
    },

    /// Rotate (or provision) a team's API key.
    RotateApikey {
        #[arg(long)]
        team: String,

        #[arg(long, default_value = "")]
        group_id: String,

        /// Hex-encoded key material; generated when omitted.
        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "/var/lib/gangway/gangway.redb")]
        database_path: PathBuf,

        #[arg(long, env = "GANGWAY_DATABASE_ENCRYPTION_KEY")]
        database_encryption_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gangwayd=debug,gangway=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Dispatcher {
            listen_address,
            keepalive_interval,
            cli_authentication,
            agent_authentication,
            database_path,
            database_encryption_key,
            agent_keys,
            oidc_issuer,
            oidc_audience,
            oidc_jwks_url,
            teams_url,
        } => {
            dispatcher_mode::run_dispatcher(dispatcher_mode::DispatcherOptions {
                listen_address,
                keepalive_interval: Duration::from_secs(keepalive_interval),
                cli_authentication,
                agent_authentication,
                database_path,
                database_encryption_key,
                agent_keys,
                oidc_issuer,
                oidc_audience,
                oidc_jwks_url,
                teams_url,
            })
            .await
        }

        Command::Agent {
            cluster,
            dispatcher_address,
            use_tls,
            preshared_key,
            kube_api_url,
            kube_token,
            kube_token_file,
            team_namespaces,
            auto_create_service_account,
        } => {
            agent_mode::run_agent(agent_mode::AgentOptions {
                cluster,
                dispatcher_address,
                use_tls,
                preshared_key,
                kube_api_url,
                kube_token,
                kube_token_file,
                team_namespaces,
                auto_create_service_account,
            })
            .await
        }

        Command::RotateApikey {
            team,
            group_id,
            key,
            database_path,
            database_encryption_key,
        } => rotate_apikey(team, group_id, key, database_path, database_encryption_key),
    }
}

fn rotate_apikey(
    team: String,
    group_id: String,
    key: Option<String>,
    database_path: PathBuf,
    database_encryption_key: String,
) -> anyhow::Result<()> {
    let encryption_key = EncryptionKey::from_hex(&database_encryption_key)?;
    let store = StateStore::open(&database_path, encryption_key)?;

    let key_material = match key {
        Some(hex_key) => hex::decode(hex_key.trim())?,
        None => {
            let mut generated = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut generated);
            generated
        }
    };

    store.rotate_api_key(&team, &group_id, &key_material)?;
    info!(%team, "api key rotated");

    // The raw key goes to stdout so provisioning pipelines can capture it.
    println!("{}", hex::encode(&key_material));
    Ok(())
}
