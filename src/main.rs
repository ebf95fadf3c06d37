use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use gantry::config::Config;
use gantry::proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "A TLS-terminating HTTP reverse proxy and load balancer")]
struct Args {
    #[arg(short, long, default_value = "config/gantry.toml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check_only: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("gantry={},access=info", level))
            }),
        )
        .init();

    info!("starting gantry");

    let config = Config::from_file_with_env(&args.config).await?;
    info!("loaded configuration from {}", args.config);

    if args.check_only {
        gantry::proxy::server::check_config(&config)?;
        info!("configuration OK");
        return Ok(());
    }

    let server = ProxyServer::new(&config)?;
    let (shutdown_tx, _) = broadcast::channel(4);

    // Setup graceful shutdown
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("received CTRL+C, shutting down gracefully...");
        let _ = signal_tx.send(());
    });

    server.run(shutdown_tx).await?;

    info!("gantry shutdown complete");
    Ok(())
}
