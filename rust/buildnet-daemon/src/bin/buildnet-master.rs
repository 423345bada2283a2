// BuildNet master daemon entry point

use anyhow::Result;
use buildnet_config::load_config;
use buildnet_daemon::api::ApiServer;
use buildnet_daemon::{MasterDaemon, SimulatedExecutor, SystemClock};
use buildnet_state::{MemoryBackend, SledBackend, StateBackend};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "buildnet-master", about = "BuildNet build-orchestration master daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "BUILDNET_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Disable the auto-build trigger
    #[arg(long)]
    no_auto_build: bool,

    /// Keep all state in memory (no sled database)
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.network.bind = bind.clone();
        config.network.advertise = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.daemon.data_dir = data_dir;
    }
    if args.no_auto_build {
        config.auto_build.enabled = false;
    }

    let backend: Arc<dyn StateBackend> = if args.ephemeral {
        Arc::new(MemoryBackend::new())
    } else {
        let path = PathBuf::from(&config.daemon.data_dir).join("state");
        Arc::new(SledBackend::open(path)?)
    };

    let daemon = MasterDaemon::new(
        config.clone(),
        backend,
        Arc::new(SystemClock),
        Arc::new(SimulatedExecutor::new()),
    )
    .await?;
    daemon.start().await?;
    info!(
        daemon_id = %config.daemon.id,
        bind = %config.network.bind,
        "BuildNet master running"
    );

    let server = ApiServer::new(daemon.clone());
    tokio::select! {
        served = server.serve(&config.network.bind) => served?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    daemon.stop().await;
    Ok(())
}
