//! Service Sync binary.
//!
//! Runs the controller role, the target role, or both, depending on
//! `runMode` in the configuration file.

use anyhow::Context;
use clap::Parser;
use service_sync::cluster::{ClusterApi, KubeCluster};
use service_sync::config::{
    ConfigHandle, ConfigWatcher, DEFAULT_CONFIG_PATH, RunMode, load_config,
};
use service_sync::controller::{Controller, ControllerContext};
use service_sync::error::SyncResult;
use service_sync::observability::init_tracing;
use service_sync::shutdown::{Shutdown, wait_for_signal};
use service_sync::target::{SyncReceiver, TargetServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Replicates Services and Endpoints between Kubernetes clusters.
#[derive(Parser)]
#[command(name = "service-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "SERVICE_SYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address the target role listens on (overrides listenAddress)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Roles to run: controller, target or sync (overrides runMode)
    #[arg(short, long)]
    run_mode: Option<RunMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(run_mode) = cli.run_mode {
        config.run_mode = run_mode;
    }
    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }

    let log_level = init_tracing(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        run_mode = %config.run_mode,
        peers = config.peers.len(),
        namespaces = ?config.sync_namespaces,
        "Starting service-sync"
    );
    tracing::debug!(config = ?config, "Loaded configuration");

    let run_mode = config.run_mode;
    let listen_address = config.listen_address;
    let handle = ConfigHandle::new(config);

    let _config_watcher = ConfigWatcher::spawn(&cli.config, handle.clone())
        .context("Failed to watch configuration file")?;
    let log_follower = log_level.follow(handle.subscribe());

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    );
    tracing::info!("Connected to Kubernetes cluster");

    let shutdown = Shutdown::new();
    let mut roles: JoinSet<(&'static str, SyncResult<()>)> = JoinSet::new();

    if run_mode.runs_target() {
        let server = TargetServer::bind(listen_address, SyncReceiver::new(Arc::clone(&cluster)))
            .await
            .context("Failed to start target server")?;
        let signal = shutdown.subscribe();
        roles.spawn(async move { ("target", server.serve(signal).await) });
    }

    if run_mode.runs_controller() {
        let controller = Controller::new(ControllerContext::new(Arc::clone(&cluster), handle.clone()))
            .context("Failed to create controller")?;
        let signal = shutdown.subscribe();
        roles.spawn(async move { ("controller", controller.run(signal).await) });
    }

    let mut failed = false;

    tokio::select! {
        signal = wait_for_signal() => {
            signal.context("Failed to listen for shutdown signals")?;
        }
        Some(joined) = roles.join_next() => {
            failed |= report(joined);
        }
    }

    shutdown.trigger();
    while let Some(joined) = roles.join_next().await {
        failed |= report(joined);
    }
    log_follower.abort();

    if failed {
        anyhow::bail!("service-sync stopped with errors");
    }
    tracing::info!("service-sync stopped");
    Ok(())
}

/// Log how a role ended. Returns `true` on failure.
fn report(joined: Result<(&'static str, SyncResult<()>), tokio::task::JoinError>) -> bool {
    match joined {
        Ok((role, Ok(()))) => {
            tracing::info!(role, "Role finished");
            false
        }
        Ok((role, Err(e))) => {
            tracing::error!(role, error = %e, "Role failed");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Role task panicked");
            true
        }
    }
}
