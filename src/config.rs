use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{DEFAULT_MAX_ENTRIES_PER_FILE, LOG_DIR};
use crate::model::{validate_service_name, ServiceDescriptor};

pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub require_admin_for_control: bool,
    #[serde(default = "default_retention_days")]
    pub log_retention_days: u32,
    #[serde(default = "default_max_logs_per_file")]
    pub max_logs_per_file: usize,
    #[serde(default = "default_expectation_window")]
    pub expectation_window_secs: u64,
    #[serde(default = "default_diagnostic_timeout")]
    pub diagnostic_timeout_secs: u64,
    // Static whitelist; entries here win over the runtime monitored set
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

fn default_polling_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_logs_per_file() -> usize {
    DEFAULT_MAX_ENTRIES_PER_FILE
}

fn default_expectation_window() -> u64 {
    30
}

fn default_diagnostic_timeout() -> u64 {
    5
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval(),
            auto_refresh: true,
            operation_timeout_secs: default_operation_timeout(),
            require_admin_for_control: false,
            log_retention_days: default_retention_days(),
            max_logs_per_file: default_max_logs_per_file(),
            expectation_window_secs: default_expectation_window(),
            diagnostic_timeout_secs: default_diagnostic_timeout(),
            services: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn expectation_window(&self) -> Duration {
        Duration::from_secs(self.expectation_window_secs)
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostic_timeout_secs)
    }
}

impl Config {
    // Load config from file, or create default if not exists
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create_default(path);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self> {
        println!("Config file not found. Creating default {}...", path.display());

        let config = Config::default();
        config.write(path)?;
        Ok(config)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let toml_content =
            toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Problems that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.monitor.operation_timeout_secs == 0 {
            problems.push("monitor.operation_timeout_secs must be at least 1".to_string());
        }
        if self.monitor.max_logs_per_file == 0 {
            problems.push("monitor.max_logs_per_file must be at least 1".to_string());
        }
        for (i, service) in self.monitor.services.iter().enumerate() {
            if let Err(e) = validate_service_name(&service.name) {
                problems.push(format!("monitor.services[{i}]: {e}"));
            }
            let duplicate = self.monitor.services[..i]
                .iter()
                .any(|other| other.matches(&service.name));
            if duplicate {
                problems.push(format!(
                    "monitor.services[{i}]: duplicate service '{}'",
                    service.name
                ));
            }
        }
        problems
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.data_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join(LOG_DIR)
    }

    // Create a test config (for unit tests)
    #[cfg(test)]
    pub fn test_config(data_dir: &Path) -> Self {
        Config {
            server: ServerConfig {
                data_dir: data_dir.display().to_string(),
                ..ServerConfig::default()
            },
            monitor: MonitorConfig {
                operation_timeout_secs: 1,
                diagnostic_timeout_secs: 1,
                ..MonitorConfig::default()
            },
        }
    }
}
