//! vmnet-broker - service daemon vending shared virtual networks.
//!
//! Binds the service socket, runs the broker loop, and exits when idle or
//! when asked to terminate with no clients connected.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vmnet_broker::{termination_signals, Broker, BrokerConfig, Listener, VirtualNetworkBackend};

#[derive(Parser, Debug)]
#[command(name = "vmnet-broker")]
#[command(about = "Shared virtual network broker")]
#[command(version)]
struct Args {
    /// JSON configuration file (defaults to the built-in networks)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Seconds to wait after the last client disconnects (0 = never exit)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = (secs > 0).then_some(secs);
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    info!(
        "[main] starting pid={} networks={}",
        std::process::id(),
        config.networks.len()
    );

    let backend = Arc::new(VirtualNetworkBackend::new());
    let broker = Broker::new(&config, backend);

    let listener = Listener::bind(&config.socket_path)
        .await
        .context("binding service socket")?;
    let signals = termination_signals().context("installing signal handlers")?;

    let reason = broker.serve(listener, signals).await?;
    info!("[main] stopped ({})", reason);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        error!("[main] {:#}", e);
        std::process::exit(1);
    }
}
