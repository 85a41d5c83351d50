//! gangway — deploy to Kubernetes from a CI pipeline.
//!
//! ```text
//! gangway deploy --cluster dev --resource deploy.json --wait
//! ```
//!
//! The exit code encodes the outcome (0 success, 1 rollout failure,
//! 2 system error, ...); pipelines branch on it.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use gangway_client::error::exit_code;
use gangway_client::{ClientError, Config, Deployer, ExitCode};

#[derive(Parser)]
#[command(name = "gangway", about = "Gangway deployment client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a deployment request and optionally wait for rollout.
    Deploy {
        /// JSON manifest file; repeat for multiple resources. A file may
        /// hold a single document or an array of documents.
        #[arg(long = "resource", required = true)]
        resources: Vec<PathBuf>,

        /// Hex-encoded team API key.
        #[arg(long, env = "GANGWAY_APIKEY")]
        apikey: Option<String>,

        /// Repository OIDC token, used instead of the API key.
        #[arg(long, env = "GANGWAY_GITHUB_TOKEN")]
        github_token: Option<String>,

        /// Target cluster.
        #[arg(long)]
        cluster: String,

        /// Dispatcher endpoint.
        #[arg(long, default_value = "http://localhost:9090")]
        server: String,

        #[arg(long, default_value = "")]
        team: String,

        #[arg(long, default_value = "")]
        environment: String,

        #[arg(long, default_value = "")]
        owner: String,

        #[arg(long, default_value = "")]
        repository: String,

        /// Git commit SHA being deployed.
        #[arg(long = "ref", default_value = "")]
        git_ref: String,

        /// Block until the deployment reaches a terminal state.
        #[arg(long)]
        wait: bool,

        /// Retry transient dispatcher failures.
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        retry: bool,

        /// Seconds between retries.
        #[arg(long, default_value = "5")]
        retry_interval: u64,

        /// Overall timeout in seconds.
        #[arg(long, default_value = "600")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Deploy {
            resources,
            apikey,
            github_token,
            cluster,
            server,
            team,
            environment,
            owner,
            repository,
            git_ref,
            wait,
            retry,
            retry_interval,
            timeout,
        } => {
            let config = Config {
                server,
                api_key: apikey,
                github_token,
                cluster,
                team,
                environment,
                owner,
                repository,
                git_ref,
                trace_parent: std::env::var("TRACEPARENT").ok(),
                wait,
                retry,
                retry_interval: Duration::from_secs(retry_interval),
                timeout: Duration::from_secs(timeout),
            };
            deploy(config, resources).await
        }
    };

    let code = exit_code(&result);
    if let Err(e) = &result {
        error!(code = code as i32, "{e}");
    }
    ProcessExitCode::from(code as u8)
}

async fn deploy(config: Config, paths: Vec<PathBuf>) -> Result<(), ClientError> {
    let mut resources = Vec::new();
    for path in &paths {
        let raw = std::fs::read(path).map_err(|e| {
            ClientError::new(
                ExitCode::InvocationFailure,
                format!("read {}: {e}", path.display()),
            )
        })?;
        let document: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
            ClientError::new(
                ExitCode::TemplateError,
                format!("parse {}: {e}", path.display()),
            )
        })?;
        match document {
            serde_json::Value::Array(docs) => resources.extend(docs),
            doc => resources.push(doc),
        }
    }

    let request = gangway_client::config::prepare(&config, &resources)?;
    let mut deployer = Deployer::connect(config).await?;
    deployer.deploy(request).await
}
