mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tunnelctl_core::{
    ConnectionSnapshot,
    Request,
    ServiceId,
    TunnelSpec,
    Worker,
};
use tunnelctl_kube::KubeClusterApi;
use tunnelctl_net::{
    current_platform_adapter,
    HostsFileAliasManager,
    LoopbackPool,
};

use crate::cli::{
    Cli,
    Command,
};
use crate::config::Config;

/// How long `status` waits for the processor to settle the tunnels it
/// just requested before printing a snapshot.
const STATUS_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Status => status(config).await,
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start_worker(config: &Config) -> anyhow::Result<Worker> {
    let cluster = Arc::new(KubeClusterApi::connect().await?);
    let ip_pool = Arc::new(LoopbackPool::new(config.loopback_cidr())?);
    let host_aliases = Arc::new(HostsFileAliasManager::new());
    let platform = current_platform_adapter();

    let worker = Worker::start(cluster, ip_pool, host_aliases, platform);

    for tunnel in &config.tunnels {
        let service = ServiceId::new(tunnel.name.clone(), tunnel.namespace.clone());
        let spec = TunnelSpec::new(service, tunnel.hostnames.clone(), tunnel.ports.clone());
        worker.submit(Request::create(spec)).await?;
    }

    Ok(worker)
}

/// `run`: start the worker, submit every configured tunnel, and block
/// until interrupted.
async fn run(config: Config) -> anyhow::Result<()> {
    let worker = start_worker(&config).await?;

    tracing::info!(tunnels = config.tunnels.len(), "tunnelctl running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    worker.shutdown().await;
    Ok(())
}

/// `status`: bring the configured tunnels up in this process, wait for
/// them to settle, print one snapshot, then tear everything back down.
/// There is no cross-process status channel, so this is a one-shot
/// demonstration of the registry accessor rather than a query against
/// an already-running `run` instance.
async fn status(config: Config) -> anyhow::Result<()> {
    let worker = start_worker(&config).await?;
    tokio::time::sleep(STATUS_SETTLE_DELAY).await;

    let mut snapshots = worker.status_all();
    snapshots.sort_by(|a, b| a.service.key().cmp(&b.service.key()));
    print_snapshots(&snapshots);

    worker.shutdown().await;
    Ok(())
}

fn print_snapshots(snapshots: &[ConnectionSnapshot]) {
    if snapshots.is_empty() {
        println!("no tunnels configured");
        return;
    }

    for snapshot in snapshots {
        let reason = snapshot.status_reason.as_deref().unwrap_or("-");
        println!(
            "{:<30} {:<10} {:<15} {:<30} {}",
            snapshot.service.key(),
            snapshot.status,
            snapshot.ip,
            snapshot.hostnames.join(","),
            reason,
        );
    }
}
