use std::net::SocketAddr;

use parley_common::Result;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Bind and serve until ctrl-c. Connect info is required by the per-IP
/// rate limiter's key extractor.
pub async fn serve(state: AppState) -> Result<()> {
    let host = state.config.gateway.host.clone();
    let port = state.config.gateway.port;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!("gateway listening on {host}:{port}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {e}");
        return;
    }
    info!("shutdown signal received");
}
