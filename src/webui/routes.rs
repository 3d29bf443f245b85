use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::audit::{parse_date, LogFilter};
use crate::broadcast::EventBroadcaster;
use crate::event::LogType;
use crate::manager::{Actor, ServiceManager};
use crate::model::{OperationResult, RegistrationRequest, ServiceDefaults};
use crate::storage::StorageError;

use super::{access_log, health, websocket};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const USER_HEADER: &str = "x-remote-user";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ServiceManager>,
    pub broadcaster: EventBroadcaster,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/services", get(list_services).post(register))
        .route("/api/services/:name", get(get_service).delete(unregister))
        .route("/api/services/:name/start", post(start))
        .route("/api/services/:name/stop", post(stop))
        .route("/api/services/:name/restart", post(restart))
        .route("/api/installed", get(list_installed))
        .route("/api/monitoring", post(add_to_monitoring))
        .route(
            "/api/monitoring/:name",
            get(is_monitored).delete(remove_from_monitoring),
        )
        .route("/api/defaults", get(get_defaults).put(put_defaults))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/count", get(get_log_count))
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health::health_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            access_log::record_access,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Caller identity comes from the fronting proxy, when there is one.
pub(crate) fn actor_from(headers: &axum::http::HeaderMap, addr: Option<SocketAddr>) -> Actor {
    Actor {
        user: headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip: addr.map(|a| a.ip().to_string()),
    }
}

fn operation_response(result: OperationResult) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

fn storage_failure(e: StorageError) -> Response {
    tracing::error!(error = %e, "storage failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn list_services(State(state): State<AppState>) -> Response {
    Json(state.manager.list_services().await).into_response()
}

async fn list_installed(State(state): State<AppState>) -> Response {
    Json(state.manager.list_installed().await).into_response()
}

async fn get_service(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manager.get_service(&name).await {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("service '{name}' not found") })),
        )
            .into_response(),
    }
}

async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    operation_response(state.manager.start(&name, &actor).await)
}

async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    operation_response(state.manager.stop(&name, &actor).await)
}

async fn restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    operation_response(state.manager.restart(&name, &actor).await)
}

async fn register(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<RegistrationRequest>,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    operation_response(state.manager.register(&request, &actor).await)
}

async fn unregister(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    operation_response(state.manager.unregister(&name, &actor).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRequest {
    #[serde(alias = "serviceName")]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "isCritical")]
    pub critical: bool,
}

async fn add_to_monitoring(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<MonitorRequest>,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    match state
        .manager
        .add_to_monitoring(
            &request.name,
            request.display_name.as_deref(),
            request.description.as_deref(),
            request.critical,
            &actor,
        )
        .await
    {
        Ok(added) => Json(json!({ "added": added })).into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn remove_from_monitoring(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let actor = actor_from(&headers, connect.map(|c| c.0));
    match state.manager.remove_from_monitoring(&name, &actor).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn is_monitored(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    Json(json!({ "monitored": state.manager.is_monitored(&name).await })).into_response()
}

async fn get_defaults(State(state): State<AppState>) -> Response {
    Json(state.manager.service_defaults().await).into_response()
}

async fn put_defaults(
    State(state): State<AppState>,
    Json(defaults): Json<ServiceDefaults>,
) -> Response {
    match state.manager.save_service_defaults(defaults.clone()).await {
        Ok(()) => Json(defaults).into_response(),
        Err(e) => storage_failure(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQueryParams {
    #[serde(rename = "type")]
    log_type: Option<String>,
    start: Option<String>,
    end: Option<String>,
    skip: Option<usize>,
    take: Option<usize>,
}

impl LogQueryParams {
    fn filter(&self) -> Result<LogFilter, String> {
        let log_type = self
            .log_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::parse::<LogType>)
            .transpose()?;
        let date = |raw: &Option<String>| {
            raw.as_deref()
                .filter(|d| !d.is_empty())
                .map(|d| parse_date(d).map_err(|e| format!("invalid date '{d}': {e}")))
                .transpose()
        };
        Ok(LogFilter {
            log_type,
            start_date: date(&self.start)?,
            end_date: date(&self.end)?,
        })
    }
}

async fn get_logs(State(state): State<AppState>, Query(params): Query<LogQueryParams>) -> Response {
    let filter = match params.filter() {
        Ok(f) => f,
        Err(e) => return bad_request(e),
    };
    let logs = state
        .manager
        .get_logs(
            &filter,
            params.skip.unwrap_or(0),
            params.take.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await;
    Json(logs).into_response()
}

async fn get_log_count(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> Response {
    match params.filter() {
        Ok(filter) => Json(json!({ "count": state.manager.get_log_count(&filter).await })).into_response(),
        Err(e) => bad_request(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, DEFAULT_MAX_ENTRIES_PER_FILE};
    use crate::control::memory::{FixedIntrospector, MemoryControl, MemoryRegistrar};
    use crate::control::{ServiceControl, ServiceRegistrar};
    use crate::manager::ManagerSettings;
    use crate::model::{ServiceDescriptor, ServiceInfo, ServiceStatus};
    use crate::monitored::MonitoredSetStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(
            MemoryControl::new()
                .with_unit("api", ServiceStatus::Stopped)
                .with_unit("worker", ServiceStatus::Running),
        );
        let audit = AuditLog::open(dir.path().join("logs"), DEFAULT_MAX_ENTRIES_PER_FILE)
            .await
            .unwrap();
        let manager = Arc::new(ServiceManager::new(
            Arc::clone(&control) as Arc<dyn ServiceControl>,
            Arc::new(MemoryRegistrar::new(Arc::clone(&control))) as Arc<dyn ServiceRegistrar>,
            Arc::new(FixedIntrospector),
            MonitoredSetStore::in_dir(dir.path()),
            audit,
            ManagerSettings {
                whitelist: vec![ServiceDescriptor::new("api")],
                operation_timeout: Duration::from_secs(1),
                diagnostic_timeout: Duration::from_secs(1),
                require_admin_for_control: false,
            },
        ));
        let (_sender, broadcaster) = EventBroadcaster::new();
        let state = AppState {
            manager,
            broadcaster,
            started: Instant::now(),
        };
        (dir, router(state))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, "alice");
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_list_and_start() {
        let (_dir, app) = app().await;

        let response = app
            .clone()
            .oneshot(request("GET", "/api/services", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let services: Vec<ServiceInfo> = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].status, ServiceStatus::Stopped);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/services/api/start", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: OperationResult = serde_json::from_value(body_json(response).await).unwrap();
        assert!(result.success);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/services/worker/stop", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logs_endpoint_records_access() {
        let (_dir, app) = app().await;

        app.clone()
            .oneshot(request("POST", "/api/services/api/start", None))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("GET", "/api/logs?type=operation", None))
            .await
            .unwrap();
        let logs = body_json(response).await;
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["userName"], "alice");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/logs/count?type=access", None))
            .await
            .unwrap();
        // The start call and the first logs query.
        assert_eq!(body_json(response).await["count"], 2);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/logs?start=not-a-date", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_monitoring_endpoints() {
        let (_dir, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/monitoring",
                Some(json!({ "name": "worker", "critical": true })),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["added"], true);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/monitoring/worker", None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["monitored"], true);

        let response = app
            .clone()
            .oneshot(request("DELETE", "/api/monitoring/worker", None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["removed"], true);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/services/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
