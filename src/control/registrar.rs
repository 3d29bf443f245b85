use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use super::systemctl::unit_name;
use super::ControlError;
use crate::model::StartupType;

pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// A fully resolved unit to create on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    pub description: String,
    pub exec_start: PathBuf,
    pub startup_type: StartupType,
    pub user: String,
    pub group: Option<String>,
}

/// Creates and removes service units.
pub trait ServiceRegistrar: Send + Sync {
    fn register(&self, spec: &UnitSpec) -> Result<(), ControlError>;
    fn unregister(&self, name: &str) -> Result<(), ControlError>;

    /// Whether `unregister` can remove this unit.
    fn is_managed(&self, name: &str) -> bool;
}

/// Writes unit files into `unit_dir` and reloads systemd.
#[derive(Debug, Clone)]
pub struct SystemdRegistrar {
    unit_dir: PathBuf,
    program: String,
}

impl Default for SystemdRegistrar {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_DIR)
    }
}

impl SystemdRegistrar {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            program: "systemctl".to_string(),
        }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(unit_name(name))
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), ControlError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ControlError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::Os(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl ServiceRegistrar for SystemdRegistrar {
    fn register(&self, spec: &UnitSpec) -> Result<(), ControlError> {
        let path = self.unit_path(&spec.name);
        if path.exists() {
            return Err(ControlError::Os(format!(
                "unit file {} already exists",
                path.display()
            )));
        }

        write_unit_file(&path, &render_unit(spec))?;
        info!(service = %spec.name, path = %path.display(), "unit file written");
        self.systemctl(&["daemon-reload"])?;

        if matches!(
            spec.startup_type,
            StartupType::Automatic | StartupType::AutomaticDelayed
        ) {
            // The unit exists at this point; enabling is best effort.
            if let Err(e) = self.systemctl(&["enable", &unit_name(&spec.name)]) {
                warn!(service = %spec.name, error = %e, "registered but could not enable");
            }
        }
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<(), ControlError> {
        let path = self.unit_path(name);
        if !path.is_file() {
            return Err(ControlError::NotManaged(name.to_string()));
        }
        if let Err(e) = self.systemctl(&["disable", &unit_name(name)]) {
            warn!(service = name, error = %e, "disable failed, removing unit anyway");
        }
        fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        info!(service = name, path = %path.display(), "unit file removed");
        self.systemctl(&["daemon-reload"])
    }

    fn is_managed(&self, name: &str) -> bool {
        self.unit_path(name).is_file()
    }
}

fn write_unit_file(path: &Path, content: &str) -> Result<(), ControlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    fs::write(path, content).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: io::Error) -> ControlError {
    ControlError::Os(format!("{}: {e}", path.display()))
}

fn quote_exec(path: &Path) -> String {
    let raw = path.display().to_string();
    if raw.contains(char::is_whitespace) {
        format!("\"{}\"", raw.replace('"', "\\\""))
    } else {
        raw
    }
}

pub fn render_unit(spec: &UnitSpec) -> String {
    let after = if spec.startup_type == StartupType::AutomaticDelayed {
        "network-online.target multi-user.target"
    } else {
        "network.target"
    };
    let group = spec
        .group
        .as_deref()
        .map(|g| format!("Group={g}\n"))
        .unwrap_or_default();
    let working_dir = spec
        .exec_start
        .parent()
        .map(|dir| format!("WorkingDirectory={}\n", dir.display()))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description={description}
After={after}

[Service]
Type=simple
ExecStart={exec_start}
{working_dir}User={user}
{group}StandardOutput=journal
StandardError=journal
SyslogIdentifier={name}

[Install]
WantedBy=multi-user.target
"#,
        description = spec.description,
        exec_start = quote_exec(&spec.exec_start),
        user = spec.user,
        name = spec.name,
    )
}
