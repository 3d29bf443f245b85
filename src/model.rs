use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use time::OffsetDateTime;

/// Lifecycle state of a service as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    Running,
    Stopped,
    Paused,
    Starting,
    Stopping,
    Continuing,
    Pausing,
    /// Unrecognised state, or configured but not registered on this host.
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "Running",
            ServiceStatus::Stopped => "Stopped",
            ServiceStatus::Paused => "Paused",
            ServiceStatus::Starting => "Starting",
            ServiceStatus::Stopping => "Stopping",
            ServiceStatus::Continuing => "Continuing",
            ServiceStatus::Pausing => "Pausing",
            ServiceStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StartupType {
    Automatic,
    AutomaticDelayed,
    #[default]
    Manual,
    Disabled,
}

impl StartupType {
    /// Lenient parse; anything unrecognised is treated as manual.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic" => StartupType::Automatic,
            "delayed" | "automatic delayed" | "automaticdelayed" | "delayed-auto" => {
                StartupType::AutomaticDelayed
            }
            "disabled" => StartupType::Disabled,
            _ => StartupType::Manual,
        }
    }

    /// Maps a systemd `UnitFileState` value.
    pub fn from_unit_file_state(state: &str) -> Self {
        match state.trim() {
            "enabled" | "enabled-runtime" => StartupType::Automatic,
            "disabled" | "masked" | "masked-runtime" => StartupType::Disabled,
            _ => StartupType::Manual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartupType::Automatic => "Automatic",
            StartupType::AutomaticDelayed => "Automatic (Delayed)",
            StartupType::Manual => "Manual",
            StartupType::Disabled => "Disabled",
        }
    }
}

impl fmt::Display for StartupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StartupType {
    fn from(value: String) -> Self {
        StartupType::parse(&value)
    }
}

impl From<StartupType> for String {
    fn from(value: StartupType) -> Self {
        value.as_str().to_string()
    }
}

/// Static metadata for a service the engine is allowed to manage.
///
/// Persisted in camelCase; the snake_case aliases let the same type be read
/// from `config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    #[serde(alias = "serviceName")]
    pub name: String,
    #[serde(default, alias = "display_name")]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "binary_path")]
    pub binary_path: String,
    #[serde(default, alias = "binary_path_alt", skip_serializing_if = "Option::is_none")]
    pub binary_path_alt: Option<String>,
    #[serde(default, alias = "isCritical")]
    pub critical: bool,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Service names are compared case-insensitively everywhere.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Live view of a service, assembled on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub status: ServiceStatus,
    pub startup_type: String,
    pub process_id: u32,
    pub binary_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path_alt: Option<String>,
    pub is_critical: bool,
    pub uptime_secs: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_status_change: Option<OffsetDateTime>,
    pub dependent_services_count: usize,
    pub memory_usage_mb: f64,
}

impl ServiceInfo {
    /// Info for a configured service with no matching unit on this host.
    pub fn unregistered(descriptor: &ServiceDescriptor) -> Self {
        let mut info = Self::from_descriptor(descriptor);
        info.startup_type = "Not registered".to_string();
        info
    }

    pub fn from_descriptor(descriptor: &ServiceDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            display_name: descriptor.display_name.clone(),
            description: descriptor.description.clone(),
            status: ServiceStatus::Unknown,
            startup_type: String::new(),
            process_id: 0,
            binary_path: descriptor.binary_path.clone(),
            binary_path_alt: descriptor.binary_path_alt.clone(),
            is_critical: descriptor.critical,
            uptime_secs: 0,
            last_status_change: None,
            dependent_services_count: 0,
            memory_usage_mb: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,
}

impl OperationResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            service_info: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            service_info: None,
        }
    }

    pub fn with_info(mut self, info: Option<ServiceInfo>) -> Self {
        self.service_info = info;
        self
    }
}

/// Parameters for creating a new unit on the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    #[serde(alias = "serviceName")]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub binary_path: String,
    #[serde(default)]
    pub binary_path_alt: Option<String>,
    #[serde(default)]
    pub startup_type: StartupType,
    #[serde(default)]
    pub description: Option<String>,
    /// Falls back to the stored service defaults when absent.
    #[serde(default)]
    pub account: Option<String>,
}

/// Account settings applied to newly registered units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefaults {
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

fn default_account() -> String {
    "root".to_string()
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            account: default_account(),
            group: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service name cannot be empty")]
    Empty,
    #[error("invalid service name '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidName(String),
    #[error("service '{0}' is not in the monitored set")]
    NotMonitored(String),
    #[error("control operations require root privileges")]
    NotPermitted,
    #[error("binary path cannot be empty")]
    BinaryMissing,
    #[error("binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),
}

/// Accepts `^[A-Za-z0-9_-]+$`.
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}
