//! laned: the inferlane dispatcher daemon

use clap::Parser;
use lane_core::{config::load_static_workloads, DispatcherConfig, ProfileRegistry};
use lane_dispatch::{affinity, scheduler, Dispatcher, UdpRpcServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "laned")]
#[command(about = "Dispatcher and scheduler for multi-tenant GPU inference clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP port for the dispatch RPC
    #[arg(long)]
    udp_port: Option<u16>,

    /// Port for the stream control RPC
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Number of UDP receive tasks
    #[arg(long)]
    udp_threads: Option<usize>,

    /// Comma-separated CPU affinity list, exactly two CPUs per UDP thread
    #[arg(long, value_delimiter = ',')]
    pin_cpus: Option<Vec<usize>>,

    /// Enable epoch scheduling
    #[arg(long)]
    epoch_schedule: Option<bool>,

    /// Beacon interval in seconds
    #[arg(long)]
    beacon: Option<u32>,

    /// Epoch scheduling interval in seconds
    #[arg(long)]
    epoch: Option<u32>,

    /// Minimum interval in seconds between triggered epoch schedules
    #[arg(long)]
    min_epoch: Option<u32>,

    /// Moving average interval in seconds for request rates
    #[arg(long)]
    avg_interval: Option<u32>,

    /// YAML model-profile table
    #[arg(long, value_name = "FILE")]
    profile_file: Option<PathBuf>,

    /// YAML static-workload file
    #[arg(long, value_name = "FILE")]
    workload_file: Option<PathBuf>,

    /// Log filter
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match DispatcherConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Cannot load configuration from {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => DispatcherConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(2);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The affinity list must be fully applicable before anything starts
    if let Err(e) = affinity::validate_pin_cpus(&config.pin_cpus) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }

    let profiles = match &config.profile_file {
        Some(path) => match ProfileRegistry::from_file(path) {
            Ok(registry) => {
                info!("Loaded {} model profiles from {}", registry.len(), path.display());
                Arc::new(registry)
            }
            Err(e) => {
                error!("Fatal: cannot load model profiles from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            error!("Fatal: no model-profile table configured (--profile-file)");
            std::process::exit(1);
        }
    };

    let static_workloads = match &config.workload_file {
        Some(path) => match load_static_workloads(path) {
            Ok(workloads) => {
                info!("Loaded {} static workload slots from {}", workloads.len(), path.display());
                workloads
            }
            Err(e) => {
                error!("Fatal: cannot load workload file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Vec::new(),
    };

    let runtime = match build_runtime(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Fatal: cannot build runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config, profiles, static_workloads)) {
        error!("Dispatcher failed: {}", e);
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut DispatcherConfig, cli: &Cli) {
    if let Some(udp_port) = cli.udp_port {
        config.udp_port = udp_port;
    }
    if let Some(rpc_port) = cli.rpc_port {
        config.rpc_port = rpc_port;
    }
    if let Some(udp_threads) = cli.udp_threads {
        config.num_udp_threads = udp_threads;
    }
    if let Some(pin_cpus) = &cli.pin_cpus {
        config.pin_cpus = pin_cpus.clone();
    }
    if let Some(epoch_schedule) = cli.epoch_schedule {
        config.epoch_schedule = epoch_schedule;
    }
    if let Some(beacon) = cli.beacon {
        config.beacon_interval_sec = beacon;
    }
    if let Some(epoch) = cli.epoch {
        config.epoch_interval_sec = epoch;
    }
    if let Some(min_epoch) = cli.min_epoch {
        config.min_epoch_sec = min_epoch;
    }
    if let Some(avg_interval) = cli.avg_interval {
        config.avg_interval_sec = avg_interval;
    }
    if let Some(profile_file) = &cli.profile_file {
        config.profile_file = Some(profile_file.clone());
    }
    if let Some(workload_file) = &cli.workload_file {
        config.workload_file = Some(workload_file.clone());
    }
    if let Some(log_level) = &cli.log_level {
        config.log_level = log_level.clone();
    }
}

/// A multi-thread runtime sized to the ingress configuration. With an
/// affinity list configured, each worker thread pins itself to the next
/// CPU in the list as it starts.
fn build_runtime(config: &DispatcherConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if !config.pin_cpus.is_empty() {
        let cpus = config.pin_cpus.clone();
        let next = Arc::new(AtomicUsize::new(0));
        builder.worker_threads(cpus.len());
        builder.on_thread_start(move || {
            let index = next.fetch_add(1, Ordering::Relaxed) % cpus.len();
            let cpu = cpus[index];
            if let Err(e) = affinity::pin_current_thread(cpu) {
                // Validated at startup; a failure here means the mask
                // changed underneath us
                warn!("Cannot pin runtime thread to cpu {}: {}", cpu, e);
            }
        });
    }
    builder.build()
}

async fn run(
    config: DispatcherConfig,
    profiles: Arc<ProfileRegistry>,
    static_workloads: Vec<Vec<lane_core::StaticWorkloadEntry>>,
) -> anyhow::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(config.clone(), profiles, static_workloads));

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.udp_port);
    let server = UdpRpcServer::bind(dispatcher.clone(), bind_addr).await?;
    server.start();

    let scheduler = scheduler::spawn(dispatcher.clone());
    info!(
        "Dispatcher running; stream control RPC is served to transports on port {}",
        config.rpc_port
    );

    wait_for_shutdown().await;
    info!("Shutting down the dispatcher");

    server.stop().await;
    scheduler.stop().await;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
