//! elasticd — the elastic scheduling daemon.
//!
//! Loads a fleet file and assembles one scheduler session around it:
//! - task types and their implementations
//! - static workers
//! - elastic providers behind loopback connectors
//! - the schedule optimizer and resource optimizer loops
//!
//! # Usage
//!
//! ```text
//! elasticd run --config fleet.toml
//! elasticd simulate --config fleet.toml --actions 200 --task-ms 150
//! elasticd check --config fleet.toml
//! ```

mod daemon;
mod fleet;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::fleet::FleetConfig;

#[derive(Parser)]
#[command(name = "elasticd", about = "Elastic scheduling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the optimizers over the configured fleet until Ctrl-C.
    Run {
        /// Fleet file.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
    /// Push a synthetic workload through the fleet and print the final
    /// session state as JSON.
    Simulate {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Number of independent actions to submit.
        #[arg(long, default_value = "100")]
        actions: usize,

        /// Wall-clock duration of every action, in milliseconds.
        #[arg(long, default_value = "100")]
        task_ms: u64,
    },
    /// Validate a fleet file and print the effective elastic settings.
    Check {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,elastic_runtime=debug,elastic_provider=debug,elasticd=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => run(FleetConfig::from_file(&config)?).await,
        Command::Simulate {
            config,
            actions,
            task_ms,
        } => simulate(FleetConfig::from_file(&config)?, actions, task_ms).await,
        Command::Check { config } => {
            let fleet = FleetConfig::from_file(&config)?;
            println!("{}", fleet.elastic.to_toml_string()?);
            info!(
                cores = fleet.cores.len(),
                workers = fleet.workers.len(),
                providers = fleet.providers.len(),
                "fleet file is valid"
            );
            Ok(())
        }
    }
}

async fn run(fleet: FleetConfig) -> anyhow::Result<()> {
    info!(goal = %fleet.elastic.optimization.goal, "elastic daemon starting");
    let assembly = daemon::assemble(&fleet).await?;
    let session = assembly.session;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let mut tasks = daemon::spawn_optimizers(&session, &shutdown_rx);
    tasks.push(daemon::spawn_provisioner(Arc::clone(&session), shutdown_rx.clone()));

    // No task engine is attached; launch events are only logged.
    let mut launches = assembly.launches;
    let mut launch_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = launches.recv() => {
                    info!(action = event.action, worker = %event.worker, impl_id = event.impl_id, "action ready to launch");
                }
                _ = launch_shutdown.changed() => break,
                else => break,
            }
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    let snapshots = session.shutdown().await;
    info!(workers = snapshots.len(), "elastic daemon stopped");
    Ok(())
}

async fn simulate(fleet: FleetConfig, actions: usize, task_ms: u64) -> anyhow::Result<()> {
    let assembly = daemon::assemble(&fleet).await?;
    let session = assembly.session;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = daemon::spawn_optimizers(&session, &shutdown_rx);
    tasks.push(daemon::spawn_provisioner(Arc::clone(&session), shutdown_rx.clone()));

    let interrupt_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt_tx.send(true);
        }
    });

    let mut waiter = shutdown_rx.clone();
    daemon::wait_for_instances(&session, &mut waiter).await;

    let accepted = daemon::submit_workload(&session, &assembly.cores, actions).await;
    info!(accepted, requested = actions, "workload submitted");
    let completed = daemon::execute(
        Arc::clone(&session),
        assembly.launches,
        task_ms,
        accepted,
        shutdown_rx.clone(),
    )
    .await;
    info!(completed, clock_ms = session.now_ms(), "workload drained");

    let state = session.state().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    session.shutdown().await;
    Ok(())
}
