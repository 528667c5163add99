//! Deployer binary.
//!
//! `deployer apply` rolls out a local definition once; `deployer serve` runs
//! the GitHub webhook service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deployer::config::{Config, LogFormat};
use deployer::gateway::{self, KubeGateway};
use deployer::server::{self, AppState};
use deployer::{CreateReplicaPolicy, Deployer, GitHubClient, WorkloadDefinition};

/// Roll a Deployment definition out to Kubernetes and wait for its pods
#[derive(Parser)]
#[command(name = "deployer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubeconfig file (defaults to KUBECONFIG, ~/.kube/config, then in-cluster)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace every rollout targets
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Expected replicas recorded on create (requested or zero)
    #[arg(long, global = true)]
    create_replicas: Option<CreateReplicaPolicy>,

    /// Log output format (text or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll out a local definition once and wait for it to converge
    Apply {
        /// Definition file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Serve GitHub push webhooks
    Serve {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = cli.log_format.unwrap_or_else(|| {
        std::env::var("DEPLOYER_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    });
    if let Err(e) = init_tracing(log_format) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let mut config = Config::default();
    config.log_format = log_format;
    if let Some(path) = cli.kubeconfig {
        config.kubeconfig = Some(path);
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(policy) = cli.create_replicas {
        config.create_policy = policy;
    }

    let result = match cli.command {
        Commands::Apply { file } => {
            if let Some(file) = file {
                config.definition_path = file;
            }
            apply(config).await
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("deployer=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn build_deployer(config: &Config) -> Result<Deployer> {
    let client = gateway::connect(config.kubeconfig.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;

    info!(namespace = %config.namespace, "Connected to Kubernetes");

    Ok(Deployer::new(
        Arc::new(KubeGateway::new(client, &config.namespace)),
        config.create_policy,
        config.poll,
    ))
}

/// Startup trigger: one rollout of the local definition.
async fn apply(config: Config) -> Result<()> {
    let definition = WorkloadDefinition::from_path(&config.definition_path)
        .await
        .with_context(|| format!("Failed to load {}", config.definition_path.display()))?;
    let deployer = build_deployer(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let report = deployer
        .rollout_definition(definition, &cancel)
        .await
        .context("Rollout failed")?;

    println!("Finished deploying {:?}", report.reconciled.labels);
    Ok(())
}

/// Webhook trigger: serve until Ctrl+C or SIGTERM.
async fn serve(config: Config) -> Result<()> {
    info!("Starting deployer webhook service...");

    if config.webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set. Webhook signatures will not be verified.");
    }

    let deployer = build_deployer(&config).await?;
    let files = GitHubClient::new(&config.github_api_url, config.github_token.as_deref())
        .context("Failed to create GitHub client")?;

    let shutdown = CancellationToken::new();
    let port = config.port;
    let state = AppState {
        config: Arc::new(config),
        deployer: Arc::new(deployer),
        files: Arc::new(files),
        shutdown: shutdown.clone(),
    };
    let app = server::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(addr = %addr, "Deployer service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Abort in-flight convergence polls so the drain completes.
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    info!("Deployer service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
