//! relayd — the RelayGrid daemon.
//!
//! Single binary running the background jobs:
//! - State store (redb)
//! - Fleet compiler (per-node runtime configs into the artifact directory)
//! - Usage accountant (sync + flow point forward against InfluxDB)
//!
//! # Usage
//!
//! ```text
//! relayd run --config /etc/relaygrid/relay.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use relay_core::RelayConfig;
use relaygrid_accounting::UsageAccountant;
use relaygrid_compiler::{CompileOptions, ConfigCompiler};
use relaygrid_metrics::InfluxClient;
use relaygrid_state::StateStore;

mod fleet;

use fleet::FleetCompiler;

#[derive(Parser)]
#[command(name = "relayd", about = "RelayGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet compiler and the usage accountant until Ctrl-C.
    Run {
        /// Path to relay.toml.
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,

        /// Skip the fleet compile job.
        #[arg(long)]
        no_compile: bool,

        /// Skip the accounting jobs.
        #[arg(long)]
        no_accounting: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relayd=debug,relaygrid_accounting=debug,relaygrid_compiler=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            no_compile,
            no_accounting,
        } => run(config, no_compile, no_accounting).await,
    }
}

async fn run(config_path: PathBuf, no_compile: bool, no_accounting: bool) -> anyhow::Result<()> {
    info!("RelayGrid daemon starting");

    let config = if config_path.exists() {
        RelayConfig::from_file(&config_path)?
    } else {
        info!(path = ?config_path, "config file not found, using defaults");
        RelayConfig::default()
    };

    // ── Initialize subsystems ──────────────────────────────────

    if let Some(parent) = config.store.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let state = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Start background tasks ─────────────────────────────────

    if !no_compile && config.compiler.interval_secs > 0 {
        let compiler = ConfigCompiler::new(
            state.clone(),
            CompileOptions::from_config(&config.compiler),
        );
        let fleet = FleetCompiler::new(compiler, config.compiler.output_dir.clone());
        let interval = Duration::from_secs(config.compiler.interval_secs);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            fleet.run(interval, shutdown).await;
        }));
    } else {
        info!("fleet compiler disabled");
    }

    if !no_accounting {
        let accountant = UsageAccountant::new(
            state.clone(),
            InfluxClient::new(&config.timeseries),
            config.accounting.clone(),
        );
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            accountant.run(shutdown).await;
        }));
    } else {
        info!("usage accountant disabled");
    }

    // ── Shutdown signal ────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("RelayGrid daemon stopped");
    Ok(())
}
