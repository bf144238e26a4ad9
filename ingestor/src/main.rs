use clap::Parser;
use ingestor::{rest, rollup, Config, ConnectionHandler, Metrics, Server, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Starting sensor ingestor");
    info!("Ingest address: {}", config.server.bind_addr());
    info!("HTTP server: {}", config.api.http_addr);
    info!("Database: {}", config.storage.database_path.display());

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            std::process::exit(1);
        }
    };

    // Storage must be usable before anything is accepted
    let storage = match Storage::open(&config.storage).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();

    let handler = ConnectionHandler::new(
        storage.clone(),
        metrics.clone(),
        config.server.buffer_size,
        config.server.read_timeout(),
        config.server.write_timeout(),
    );
    let server = match Server::bind(&config.server, handler, metrics.clone(), cancel.clone()).await
    {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let server_handle = tokio::spawn(server.run());

    // Spawn rollup refresher
    let (rollup_tx, rollup_rx) = rollup::channel();
    let rollup_handle = tokio::spawn(rollup::run_rollup_refresher(
        storage.clone(),
        Duration::from_secs(config.api.rollup_interval_secs),
        rollup_tx,
        cancel.clone(),
    ));

    let app = rest::create_router(storage.clone(), metrics, rollup_rx);
    let listener = match tokio::net::TcpListener::bind(config.api.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.api.http_addr, e);
            std::process::exit(1);
        }
    };
    info!("HTTP server listening on {}", config.api.http_addr);

    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(http_cancel.cancelled_owned())
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    cancel.cancel();

    for (name, handle) in [
        ("ingest server", server_handle),
        ("rollup refresher", rollup_handle),
        ("HTTP server", http_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    storage.close().await;
    info!("Shutdown complete");
}
