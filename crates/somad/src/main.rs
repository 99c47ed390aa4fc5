//! somad: the Soma daemon.
//!
//! Single binary that assembles the Soma subsystems:
//! - State store (redb)
//! - One tree keeper per repository, under a supervisor
//! - Deployment lifecycle engine (unblock / retire / poke cycle)
//! - REST API with the guide post and deployment query endpoints
//!
//! # Usage
//!
//! ```text
//! somad run --listen 0.0.0.0:8443 --data-dir /var/lib/soma
//! somad relay --soma-url http://soma:8443 --id <instance> --result success
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use soma_api::{ApiState, build_router};
use soma_lifecycle::DeploymentEngine;
use soma_lifecycle::notify::relay_feedback;
use soma_state::{FeedbackResult, StateStore};
use soma_treekeeper::Supervisor;

use crate::config::{LogFormat, Overrides, SomaConfig};

const DEFAULT_FILTER: &str = "info,somad=debug,soma=debug";

#[derive(Parser)]
#[command(name = "somad", about = "Soma check deployment daemon")]
struct Cli {
    /// Path to soma.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and run keepers and the deployment engine (default).
    Run {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds between deployment engine cycles.
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Poke timeout in milliseconds.
        #[arg(long)]
        poke_timeout_ms: Option<u64>,

        /// Tree keeper mailbox capacity.
        #[arg(long)]
        mailbox_capacity: Option<usize>,
    },

    /// Report a rollout/deprovision result to a Soma instance.
    Relay {
        /// Base URL of the Soma API.
        #[arg(long)]
        soma_url: String,

        /// Check instance id.
        #[arg(long)]
        id: String,

        /// `success` or `failed`.
        #[arg(long)]
        result: FeedbackResult,

        /// Request timeout in milliseconds.
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut overrides = Overrides {
        log_format: cli.log_format,
        ..Default::default()
    };
    let command = cli.command.unwrap_or(Command::Run {
        listen: None,
        data_dir: None,
        interval_secs: None,
        poke_timeout_ms: None,
        mailbox_capacity: None,
    });
    if let Command::Run {
        listen,
        data_dir,
        interval_secs,
        poke_timeout_ms,
        mailbox_capacity,
    } = &command
    {
        overrides.listen = *listen;
        overrides.data_dir = data_dir.clone();
        overrides.interval_secs = *interval_secs;
        overrides.poke_timeout_ms = *poke_timeout_ms;
        overrides.mailbox_capacity = *mailbox_capacity;
    }

    let config = SomaConfig::load(cli.config.as_deref())?.apply(&overrides)?;
    init_tracing(config.log_format);

    match command {
        Command::Run { .. } => run(config).await,
        Command::Relay {
            soma_url,
            id,
            result,
            timeout_ms,
        } => relay(&soma_url, &id, result, Duration::from_millis(timeout_ms)).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(config: SomaConfig) -> anyhow::Result<()> {
    info!("Soma daemon starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let supervisor = Supervisor::new(store.clone(), config.keeper.mailbox_capacity);
    let keepers = supervisor.start_all().await?;
    info!(keepers, "tree keepers starting");

    let engine = DeploymentEngine::new(store.clone(), config.engine_config());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let engine_handle = tokio::spawn(async move {
        engine.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(store, supervisor.clone()));
    info!(addr = %config.listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(config.listen).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = engine_handle.await;
    supervisor.shutdown_all().await;

    info!("Soma daemon stopped");
    Ok(())
}

async fn relay(
    soma_url: &str,
    id: &str,
    result: FeedbackResult,
    timeout: Duration,
) -> anyhow::Result<()> {
    let status = relay_feedback(soma_url, id, result, timeout).await?;
    if !status.is_success() {
        anyhow::bail!("soma answered {status} for {id}/{result}");
    }
    info!(%soma_url, %id, %result, "feedback relayed");
    Ok(())
}
