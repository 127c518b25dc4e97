//! HTTP serving.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::startup;

/// Serve the allocation API until Ctrl-C.
pub async fn run_serve(config_path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    info!("Designate daemon starting");

    let (config, allocator) = startup::load(config_path)?;
    let router = designate_api::build_router(Arc::new(allocator));
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.listen.port)));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Designate daemon stopped");
    Ok(())
}
