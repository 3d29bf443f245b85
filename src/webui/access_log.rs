use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tracing::error;

use crate::event::LogEntry;

use super::routes::{actor_from, AppState};

// Writes an Access entry for every /api request after it completes.
pub async fn record_access(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let actor = actor_from(request.headers(), connect.map(|c| c.0));

    let response = next.run(request).await;

    if path.starts_with("/api/") {
        let entry = LogEntry::access(&method, &path, response.status().as_u16())
            .by(actor.user.as_deref(), actor.ip.as_deref());
        if let Err(e) = state.manager.audit().append(entry).await {
            error!(error = %e, "failed to record access");
        }
    }
    response
}
