use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::cli::OutputFormat;
use crate::config::Config;
use crate::manager::{Actor, ServiceManager};
use crate::model::{OperationResult, RegistrationRequest, StartupType};
use crate::webui::routes::USER_HEADER;

use super::status::print_service_table;

#[derive(Debug, Clone, Copy)]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Unregister,
}

// Build a runtime and a systemd-backed manager for a single CLI command.
fn with_manager<T, F, Fut>(config: &Config, f: F) -> Result<T>
where
    F: FnOnce(ServiceManager) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async {
        let manager = ServiceManager::from_config(config)
            .await
            .with_context(|| format!("Failed to open data directory {}", config.server.data_dir))?;
        f(manager).await
    })
}

const PING_TIMEOUT: Duration = Duration::from_millis(500);

// Wildcard binds are reached over loopback.
fn server_base(config: &Config) -> String {
    let host = match config.server.bind.as_str() {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        other if other.contains(':') && !other.starts_with('[') => format!("[{other}]"),
        other => other.to_string(),
    };
    format!("http://{}:{}", host, config.server.port)
}

// Changes go through a running server when there is one, so they share its
// manager, tracker and audit log.
struct RemoteServer {
    client: Client,
    base: String,
}

#[derive(Deserialize)]
struct AddedResponse {
    added: bool,
}

#[derive(Deserialize)]
struct RemovedResponse {
    removed: bool,
}

impl RemoteServer {
    fn for_config(config: &Config) -> Option<Self> {
        // Operations wait up to the configured timeout plus the diagnostic run.
        let timeout = config.monitor.operation_timeout()
            + config.monitor.diagnostic_timeout()
            + Duration::from_secs(5);
        Self::connect(server_base(config), timeout)
    }

    fn connect(base: String, timeout: Duration) -> Option<Self> {
        let client = Client::builder().timeout(timeout).build().ok()?;
        let up = client
            .get(format!("{}/health", base))
            .timeout(PING_TIMEOUT)
            .send()
            .is_ok_and(|r| r.status().is_success());
        if !up {
            debug!(%base, "no running server, using local manager");
            return None;
        }
        debug!(%base, "routing command through running server");
        Some(Self { client, base })
    }

    fn send(&self, request: RequestBuilder) -> Result<reqwest::blocking::Response> {
        let request = match Actor::local().user {
            Some(user) => request.header(USER_HEADER, user),
            None => request,
        };
        request.send().context("Failed to reach svcwatch server")
    }

    // Control endpoints answer 400 with an OperationResult on failure.
    fn operation(&self, request: RequestBuilder) -> Result<OperationResult> {
        let response = self.send(request)?;
        let status = response.status();
        response
            .json()
            .with_context(|| format!("Unexpected server response ({})", status))
    }

    fn control(&self, action: ControlAction, name: &str) -> Result<OperationResult> {
        let url = format!("{}/api/services/{}", self.base, name);
        let request = match action {
            ControlAction::Start => self.client.post(format!("{url}/start")),
            ControlAction::Stop => self.client.post(format!("{url}/stop")),
            ControlAction::Restart => self.client.post(format!("{url}/restart")),
            ControlAction::Unregister => self.client.delete(url),
        };
        self.operation(request)
    }

    fn register(&self, request: &RegistrationRequest) -> Result<OperationResult> {
        self.operation(self.client.post(format!("{}/api/services", self.base)).json(request))
    }

    fn checked(&self, request: RequestBuilder) -> Result<reqwest::blocking::Response> {
        let response = self.send(request)?;
        if !response.status().is_success() {
            anyhow::bail!("Server returned status: {}", response.status());
        }
        Ok(response)
    }

    fn add_to_monitoring(
        &self,
        name: &str,
        display_name: Option<&str>,
        description: Option<&str>,
        critical: bool,
    ) -> Result<bool> {
        let body = json!({
            "name": name,
            "displayName": display_name,
            "description": description,
            "critical": critical,
        });
        let request = self.client.post(format!("{}/api/monitoring", self.base)).json(&body);
        let response = self.checked(request)?;
        let parsed: AddedResponse = response.json().context("Failed to parse server response")?;
        Ok(parsed.added)
    }

    fn remove_from_monitoring(&self, name: &str) -> Result<bool> {
        let request = self.client.delete(format!("{}/api/monitoring/{}", self.base, name));
        let response = self.checked(request)?;
        let parsed: RemovedResponse = response.json().context("Failed to parse server response")?;
        Ok(parsed.removed)
    }
}

fn report(result: OperationResult) -> Result<()> {
    if result.success {
        println!("✓ {}", result.message);
        Ok(())
    } else {
        anyhow::bail!(result.message)
    }
}

pub fn list_services(config: &Config, installed: bool, format: OutputFormat) -> Result<()> {
    let services = with_manager(config, |manager| async move {
        Ok(if installed {
            manager.list_installed().await
        } else {
            manager.list_services().await
        })
    })?;

    match format {
        OutputFormat::Human => {
            if services.is_empty() {
                if installed {
                    println!("No installed services found");
                } else {
                    println!("No monitored services. Add some with `svcwatch monitor add <name>`");
                }
            } else {
                print_service_table(&services);
                println!();
                println!("{} service(s), * = critical", services.len());
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&services)?;
            println!("{}", json);
        }
    }
    Ok(())
}

pub fn run_control(config: &Config, action: ControlAction, name: String) -> Result<()> {
    if let Some(remote) = RemoteServer::for_config(config) {
        return report(remote.control(action, &name)?);
    }
    let result = with_manager(config, |manager| async move {
        let actor = Actor::local();
        Ok(match action {
            ControlAction::Start => manager.start(&name, &actor).await,
            ControlAction::Stop => manager.stop(&name, &actor).await,
            ControlAction::Restart => manager.restart(&name, &actor).await,
            ControlAction::Unregister => manager.unregister(&name, &actor).await,
        })
    })?;
    report(result)
}

#[allow(clippy::too_many_arguments)]
pub fn run_register(
    config: &Config,
    name: String,
    binary_path: String,
    binary_path_alt: Option<String>,
    display_name: Option<String>,
    description: Option<String>,
    startup_type: String,
    account: Option<String>,
) -> Result<()> {
    let request = RegistrationRequest {
        name,
        display_name: display_name.unwrap_or_default(),
        binary_path,
        binary_path_alt,
        startup_type: StartupType::parse(&startup_type),
        description,
        account,
    };
    if let Some(remote) = RemoteServer::for_config(config) {
        return report(remote.register(&request)?);
    }
    let result = with_manager(config, |manager| async move {
        Ok(manager.register(&request, &Actor::local()).await)
    })?;
    report(result)
}

pub fn monitor_add(
    config: &Config,
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    critical: bool,
) -> Result<()> {
    let added = match RemoteServer::for_config(config) {
        Some(remote) => remote.add_to_monitoring(
            &name,
            display_name.as_deref(),
            description.as_deref(),
            critical,
        )?,
        None => with_manager(config, |manager| async move {
            manager
                .add_to_monitoring(
                    &name,
                    display_name.as_deref(),
                    description.as_deref(),
                    critical,
                    &Actor::local(),
                )
                .await
                .context("Failed to update monitored set")
        })?,
    };

    if !added {
        anyhow::bail!("Service was not added (invalid name, not installed, or already monitored)");
    }
    println!("✓ Added to monitoring");
    Ok(())
}

pub fn monitor_remove(config: &Config, name: String) -> Result<()> {
    let removed = match RemoteServer::for_config(config) {
        Some(remote) => remote.remove_from_monitoring(&name)?,
        None => with_manager(config, |manager| async move {
            manager
                .remove_from_monitoring(&name, &Actor::local())
                .await
                .context("Failed to update monitored set")
        })?,
    };

    if !removed {
        anyhow::bail!("Service was not removed (not in the runtime monitored set)");
    }
    println!("✓ Removed from monitoring");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use std::sync::mpsc;
    use tempfile::TempDir;

    // Serves a stand-in for the svcwatch API on a background thread.
    fn spawn_stub_server() -> String {
        let app = Router::new()
            .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
            .route(
                "/api/services/:name/start",
                post(|Path(name): Path<String>, headers: HeaderMap| async move {
                    let user = headers
                        .get(USER_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string();
                    Json(OperationResult::success(format!("Started '{name}' for {user}")))
                }),
            )
            .route(
                "/api/services/:name/stop",
                post(|Path(name): Path<String>| async move {
                    let result = OperationResult::failure(format!("Service '{name}' is not monitored"));
                    (StatusCode::BAD_REQUEST, Json(result)).into_response()
                }),
            )
            .route(
                "/api/monitoring",
                post(|Json(body): Json<serde_json::Value>| async move {
                    Json(json!({ "added": body["name"] == "api" && body["critical"] == true }))
                }),
            )
            .route(
                "/api/monitoring/:name",
                delete(|Path(name): Path<String>| async move { Json(json!({ "removed": name == "api" })) }),
            );

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });
        format!("http://{}", rx.recv().unwrap())
    }

    #[test]
    fn test_report() {
        assert!(report(OperationResult::success("Started 'nginx'")).is_ok());

        let err = report(OperationResult::failure("Service 'nginx' is not monitored")).unwrap_err();
        assert_eq!(err.to_string(), "Service 'nginx' is not monitored");
    }

    #[test]
    fn test_server_base_uses_loopback_for_wildcard_binds() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::test_config(dir.path());
        config.server.port = 9191;

        config.server.bind = "0.0.0.0".to_string();
        assert_eq!(server_base(&config), "http://127.0.0.1:9191");
        config.server.bind = "::".to_string();
        assert_eq!(server_base(&config), "http://[::1]:9191");
        config.server.bind = "10.0.0.5".to_string();
        assert_eq!(server_base(&config), "http://10.0.0.5:9191");
    }

    #[test]
    fn test_no_server_falls_back_to_local() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(RemoteServer::connect(format!("http://{addr}"), Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_commands_route_through_running_server() {
        let base = spawn_stub_server();
        let remote = RemoteServer::connect(base, Duration::from_secs(5)).unwrap();

        let started = remote.control(ControlAction::Start, "api").unwrap();
        assert!(started.success);
        assert!(started.message.starts_with("Started 'api' for "));

        // A 400 still carries the operation result.
        let stopped = remote.control(ControlAction::Stop, "api").unwrap();
        assert!(!stopped.success);
        assert_eq!(
            report(stopped).unwrap_err().to_string(),
            "Service 'api' is not monitored"
        );

        assert!(remote.add_to_monitoring("api", None, None, true).unwrap());
        assert!(!remote.add_to_monitoring("api", None, None, false).unwrap());
        assert!(remote.remove_from_monitoring("api").unwrap());
        assert!(!remote.remove_from_monitoring("web").unwrap());
    }
}
