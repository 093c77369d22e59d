//! socketr demo server
//!
//! Listens on the configured address and answers every text line with an
//! acknowledgement, or logs raw chunks in raw framing mode. Runs until
//! Ctrl+C, then shuts down gracefully.

use socketr::config::Config;
use socketr::{ConnectionInfo, DataHandler, Server, ServerError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        framing = %config.framing,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting socketr server"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(serve(config))?;
    Ok(())
}

async fn serve(config: Config) -> Result<(), ServerError> {
    let server = Arc::new(
        Server::with_options(config.server_options())
            .on_connected(|conn: &ConnectionInfo| {
                info!(peer = %conn.peer, conn_id = conn.id, "Client connected");
                Ok(())
            })
            .on_data(DataHandler::default_for(config.framing))
            .on_error(|err: &ServerError| {
                error!(error = %err, "An error occurred");
            }),
    );

    let shutdown = CancellationToken::new();
    let stopper = {
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                    info!("Shutdown signal received");
                }
                _ = shutdown.cancelled() => {}
            }
            server.stop().await
        })
    };

    let result = server.start(&config.host, config.port, CancellationToken::new()).await;

    // Listener failed on its own: let the stopper clean up
    shutdown.cancel();
    match stopper.await {
        Ok(stopped) => stopped?,
        Err(e) => error!(error = %e, "Shutdown task failed"),
    }

    info!("Server stopped");
    result
}
