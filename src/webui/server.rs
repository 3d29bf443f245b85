use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::routes::{router, AppState};

pub async fn start_server(
    bind: &str,
    port: u16,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;

    info!(address = %listener.local_addr()?, "web server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Server error")
}
