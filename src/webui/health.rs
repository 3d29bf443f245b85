use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::routes::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub monitored_services: usize,
    pub pending_expectations: usize,
    pub subscribers: usize,
    pub timestamp: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        monitored_services: state.manager.monitored_descriptors().await.len(),
        pending_expectations: state.manager.tracker().pending(),
        subscribers: state.broadcaster.subscriber_count(),
        timestamp: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
    })
}
