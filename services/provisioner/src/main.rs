//! cirrus - provision Kubernetes clusters on Tencent Cloud
//!
//! Cluster specs are TOML documents; assembled clusters are written as JSON
//! so that a later `join` or `sync` can pick them up again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cirrus_provisioner::{
    Cluster, ClusterSpec, CommandSshTransport, Config, Orchestrator, OrchestratorConfig,
    TencentClient,
};

/// Provision, grow and delete clusters on Tencent Cloud.
#[derive(Debug, Parser)]
#[command(name = "cirrus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Write the JSON result here instead of stdout.
    #[arg(long, short, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a cluster from a spec file.
    Create {
        /// Cluster spec (TOML).
        #[arg(long)]
        spec: PathBuf,
    },

    /// Add nodes to an existing cluster.
    Join {
        /// Cluster document written by a previous create (JSON).
        #[arg(long)]
        state: PathBuf,

        /// Masters to add.
        #[arg(long, default_value_t = 0)]
        master: usize,

        /// Workers to add.
        #[arg(long, default_value_t = 0)]
        worker: usize,
    },

    /// Delete every tagged resource of a cluster.
    Delete {
        /// Cluster spec (TOML).
        #[arg(long)]
        spec: PathBuf,

        /// Tolerate cleanup failures and missing clusters.
        #[arg(long)]
        force: bool,
    },

    /// Show the provider-side view of a cluster.
    Describe {
        /// Cluster spec (TOML).
        #[arg(long)]
        spec: PathBuf,
    },

    /// Refresh node status in a cluster document.
    Sync {
        /// Cluster document (JSON).
        #[arg(long)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(?config, "Configuration loaded");

    if let Err(e) = run(cli, &config).await {
        error!(error = %e, "Command failed");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli, config: &Config) -> Result<()> {
    let output = cli.output;
    match cli.command {
        Commands::Create { spec } => {
            let spec = read_spec(&spec).await?;
            let cluster = orchestrator(config, &spec.region)
                .create(&spec)
                .await
                .context("create failed")?;
            emit(output.as_deref(), &cluster).await
        }
        Commands::Join {
            state,
            master,
            worker,
        } => {
            let cluster = read_cluster(&state).await?;
            let region = cluster.spec.region.clone();
            let cluster = orchestrator(config, &region)
                .join(cluster, master, worker)
                .await
                .context("join failed")?;
            emit(output.as_deref(), &cluster).await
        }
        Commands::Delete { spec, force } => {
            let spec = read_spec(&spec).await?;
            let report = orchestrator(config, &spec.region)
                .delete(&spec, force)
                .await
                .context("delete failed")?;
            emit(output.as_deref(), &report).await
        }
        Commands::Describe { spec } => {
            let spec = read_spec(&spec).await?;
            let info = orchestrator(config, &spec.region)
                .describe_cluster(&spec)
                .await
                .context("describe failed")?;
            emit(output.as_deref(), &info).await
        }
        Commands::Sync { state } => {
            let mut cluster = read_cluster(&state).await?;
            let region = cluster.spec.region.clone();
            orchestrator(config, &region)
                .sync_nodes(&mut cluster)
                .await
                .context("sync failed")?;
            emit(output.as_deref(), &cluster).await
        }
    }
}

/// Build an orchestrator against the spec's region, falling back to the
/// configured one.
fn orchestrator(config: &Config, region: &str) -> Orchestrator {
    let mut config = config.clone();
    if !region.is_empty() {
        config.region = region.to_string();
    }
    let backoff = config.backoff();

    Orchestrator::new(
        Arc::new(TencentClient::from_config(&config)),
        Arc::new(CommandSshTransport::default()),
        OrchestratorConfig {
            backoff: backoff.clone(),
            rollback_backoff: backoff,
        },
    )
}

async fn read_spec(path: &Path) -> Result<ClusterSpec> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading spec {}", path.display()))?;
    ClusterSpec::from_toml(&raw).with_context(|| format!("parsing spec {}", path.display()))
}

async fn read_cluster(path: &Path) -> Result<Cluster> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading cluster state {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing cluster state {}", path.display()))
}

async fn emit<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
