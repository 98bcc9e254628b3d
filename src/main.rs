//! Process entry point: CLI parsing, config bootstrap, and the axum server.

use axum::Router;
use clap::Parser;
use objectstorage_datalayer::api::{router, AppState};
use objectstorage_datalayer::config::ConfigurationManager;
use objectstorage_datalayer::storage::StorageEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Object-storage data layer server.
#[derive(Parser, Debug)]
#[command(name = "objectstorage-datalayer")]
#[command(version, author, about, long_about = None)]
struct Cli {
    /// Path to a local configuration document, used in place of
    /// `CONFIG_LOCATION` (wrapped as a `file://` URL).
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address, overriding `SERVER_PORT`.
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose (trace-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Explicit runtime builder rather than `#[tokio::main]` — keeps the
    // door open for tuning blocking-thread counts before startup.
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("objectstorage_datalayer=trace,tower_http=trace")
        } else {
            EnvFilter::new("objectstorage_datalayer=debug,tower_http=debug")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_location = match &cli.config {
        Some(path) => format!("file://{path}"),
        None => std::env::var("CONFIG_LOCATION").map_err(|_| "CONFIG_LOCATION is not set")?,
    };

    info!(location = %config_location, "loading dataset configuration");
    let manager = Arc::new(ConfigurationManager::load(config_location).await?);

    if let Ok(raw) = std::env::var("CONFIG_REFRESH_INTERVAL") {
        let interval = humantime::parse_duration(&raw)?;
        manager.clone().spawn_refresh(interval);
        info!(?interval, "spawned configuration refresh task");
    }

    let local_root = std::env::var("LOCALSTORAGE_ROOT").unwrap_or_else(|_| "./data".to_string());
    let engine = Arc::new(StorageEngine::new(manager, local_root));
    let state = Arc::new(AppState { engine });

    let app: Router = router(state).layer(TraceLayer::new_for_http());

    let listen_addr: SocketAddr = cli
        .listen
        .or_else(|| std::env::var("SERVER_PORT").ok().map(|p| format!("0.0.0.0:{p}")))
        .unwrap_or_else(|| "0.0.0.0:8080".to_string())
        .parse()?;

    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C, shutting down"),
        _ = terminate => warn!("received SIGTERM, shutting down"),
    }
}
