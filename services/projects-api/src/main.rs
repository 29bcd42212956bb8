use std::net::SocketAddr;

use makeprojects_toolkit::context::memory::MemoryStore;
use makeprojects_toolkit::prelude::*;
use projects_api::AppState;
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("projects-api")?;
    init_tracing(&config)?;

    if config.database_url().is_some() {
        warn!("Database configuration ignored; projects-api runs on the in-process store");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));
    let app = projects_api::router(AppState::new(config, MemoryStore::new()));

    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
