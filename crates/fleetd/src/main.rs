//! fleetd: the Fleet control plane daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Resource catalog and job registry
//! - Job operator (leader-elected, drains job finalizers)
//! - Job scheduler + workers
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml
//! fleetd migrate --config /etc/fleet/fleet.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_operator::Operator;
use fleet_registry::{Catalog, Registry};
use fleet_scheduler::{CommandExecutor, JobReconciler, JobSpec, Scheduler, register_job_kinds};
use fleet_state::StateStore;

use crate::config::{FleetConfig, LogFormat};

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Override `store.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Rewrite stored jobs into the current schema version and exit.
    Migrate {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let mut config = FleetConfig::load(&config)?;
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            init_tracing(&config);
            run(config).await
        }
        Command::Migrate { config } => {
            let config = FleetConfig::load(&config)?;
            init_tracing(&config);
            migrate(&config)
        }
    }
}

fn init_tracing(config: &FleetConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Open the store and the job registry.
fn open(config: &FleetConfig) -> anyhow::Result<Arc<Registry<JobSpec>>> {
    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let mut catalog = Catalog::new();
    register_job_kinds(&mut catalog);
    Ok(Arc::new(Registry::new(
        store,
        Arc::new(catalog),
        config.job_registry(),
    )))
}

fn migrate(config: &FleetConfig) -> anyhow::Result<()> {
    let jobs = open(config)?;
    let migrated = jobs.migrate_objects()?;
    info!(migrated, "job migration complete");
    Ok(())
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("Fleet daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let jobs = open(&config)?;
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let operator = Operator::new(
        Arc::clone(&jobs),
        JobReconciler::new(&log_dir),
        config.operator(),
    );
    info!(holder = %operator.config().holder, "job operator initialized");

    let scheduler = Scheduler::new(Arc::clone(&jobs), Arc::new(CommandExecutor), config.scheduler());
    info!(log_dir = %log_dir.display(), "scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            } else {
                info!("shutdown signal received");
            }
            cancel.cancel();
        });
    }

    // ── Start background tasks ─────────────────────────────────

    // A subsystem that stops for any reason takes the others down with it.
    let operator_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = operator.run(cancel.clone()).await;
            cancel.cancel();
            result
        }
    });
    let scheduler_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = scheduler.run(cancel.clone()).await;
            cancel.cancel();
            result
        }
    });

    let (operator_result, scheduler_result) = tokio::join!(operator_handle, scheduler_handle);
    match operator_result? {
        Ok(()) | Err(fleet_operator::OperatorError::Cancelled) => {}
        Err(e) => error!(error = %e, "job operator failed"),
    }
    if let Err(e) = scheduler_result? {
        error!(error = %e, "scheduler failed");
    }

    info!("Fleet daemon stopped");
    Ok(())
}
