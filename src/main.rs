//! Stamping client entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use stamping_client::client::StampingClient;
use stamping_client::config::ClientConfig;
use stamping_client::lock::InstanceLock;
use stamping_client::metrics;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stamping-client", version, about = "Badge reader stamping ingestion client")]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(short, long, env = "STAMPING_CLIENT_CONFIG", default_value = "client.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new stampings from the configured source and deliver them
    Run,
    /// Replay stampings that previously failed delivery
    ResendBad,
}

fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stamping_client=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn execute(cli: &Cli) -> anyhow::Result<()> {
    let config = ClientConfig::load(&cli.config)?;
    config.ensure_directories()?;

    // cron may fire a new run while a slow cycle is still in flight
    let mut lock = InstanceLock::open(&config.lock_path())?;
    let _guard = lock.try_acquire()?;

    if let Err(e) = metrics::init_metrics(&config.metrics) {
        error!(error = %e, "metrics exporter not installed, continuing without");
    }

    let started = Instant::now();
    info!(config = %cli.config.display(), "stamping client starting");

    let client = StampingClient::new(config.clone())?;
    match cli.command {
        Commands::Run => client.run_cycle().await?,
        Commands::ResendBad => client.resend_bad_cycle().await?,
    }

    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        "stamping client done"
    );

    // the process is short-lived; let the exporter push the final counts
    if config.metrics.enabled {
        tokio::time::sleep(Duration::from_secs(config.metrics.push_interval_secs)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = execute(&cli).await {
        error!("client failed: {e}");
        std::process::exit(1);
    }
}
