//! Pricebus daemon - real-time price broadcast server

use anyhow::{Context, Result};
use clap::Parser;
use pricebus::config::ServeArgs;
use pricebus::server::PricebusServer;
use pricebus::storage::{
    ConnectionLog, MemoryTokenStore, PostgresConfig, PostgresStore, TokenStore, TracingConnectionLog,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pricebusd")]
#[command(about = "Pricebus real-time broadcast daemon")]
#[command(version)]
struct Args {
    #[command(flatten)]
    serve: ServeArgs,

    /// Database URL; without one only anonymous connections are served
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_server(args).await
}

async fn run_server(args: Args) -> Result<()> {
    let config = args.serve.to_config()?;
    let bind_addr = config.bind_addr;

    let (store, log) = match &args.database_url {
        Some(url) => {
            let db_config = PostgresConfig::from_url(url).context("Invalid DATABASE_URL")?;
            let store = Arc::new(PostgresStore::new(db_config).await?);
            (store.clone() as Arc<dyn TokenStore>, store as Arc<dyn ConnectionLog>)
        }
        None => {
            warn!("No database configured; serving anonymous connections only");
            (
                Arc::new(MemoryTokenStore::new()) as Arc<dyn TokenStore>,
                Arc::new(TracingConnectionLog) as Arc<dyn ConnectionLog>,
            )
        }
    };

    let server = PricebusServer::new(config, store, log)?;

    info!(addr = %bind_addr, "Pricebus daemon starting");

    server.run_until(shutdown_signal()).await?;

    info!("Pricebus daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping server");
}
