//! Service entry: constructs the driver and pool, wires the HTTP adapter
//! and handles graceful shutdown on SIGINT/SIGTERM.

mod metrics;
mod routes;
mod state;

pub use metrics::Metrics;
pub use routes::router;
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::signal;
use tracing::{info, warn};

use scraper_pool_common::AppConfig;
use scraper_pool_core::{ChromeDriver, ContextPool};

/// Run the scraper pool service until a termination signal arrives.
pub async fn run_server(config: AppConfig) -> Result<()> {
    let driver = Arc::new(ChromeDriver::new(config.browser.clone()));
    let pool = ContextPool::new(config.pool.clone(), driver);
    pool.start()
        .await
        .map_err(|e| anyhow::anyhow!("pool startup failed: {e}"))?;

    let metrics = Metrics::new()?;
    let app = router(AppState {
        pool: pool.clone(),
        metrics,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, max_contexts = config.pool.max_contexts, "scraper pool listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("http server stopped; draining the pool");
    pool.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received Ctrl+C signal");
        }
        _ = terminate => {
            warn!("received SIGTERM signal");
        }
    }
}
