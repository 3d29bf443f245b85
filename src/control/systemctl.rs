use std::collections::HashMap;
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{wait_for_status, ControlError, ServiceControl, UnitSnapshot, STATUS_POLL_INTERVAL};
use crate::model::{ServiceStatus, StartupType};

const SHOW_PROPERTIES: &str =
    "Id,Description,LoadState,ActiveState,FreezerState,MainPID,UnitFileState,RequiredBy,WantedBy,BoundBy";

/// Facade backed by the `systemctl` command line.
#[derive(Debug, Clone)]
pub struct SystemctlControl {
    program: String,
}

impl Default for SystemctlControl {
    fn default() -> Self {
        Self {
            program: "systemctl".to_string(),
        }
    }
}

impl SystemctlControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, args: &[&str]) -> Result<Output, ControlError> {
        debug!(program = %self.program, ?args, "running");
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ControlError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, ControlError> {
        let output = self.run(args)?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ControlError::Os(format!(
                "systemctl {} failed: {}",
                args.first().copied().unwrap_or_default(),
                if err.is_empty() { output.status.to_string() } else { err }
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn transition(
        &self,
        verb: &str,
        name: &str,
        target: ServiceStatus,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        // Confirms the unit exists before queueing the job.
        self.describe(name)?;
        let started = Instant::now();
        self.run_checked(&[verb, "--no-block", &unit_name(name)])?;
        let remaining = timeout.saturating_sub(started.elapsed());
        wait_for_status(self, name, target, remaining, STATUS_POLL_INTERVAL).map_err(|e| match e {
            ControlError::Timeout { name, target, .. } => ControlError::Timeout {
                name,
                target,
                timeout,
            },
            other => other,
        })
    }
}

impl ServiceControl for SystemctlControl {
    fn describe(&self, name: &str) -> Result<UnitSnapshot, ControlError> {
        let property_arg = format!("--property={SHOW_PROPERTIES}");
        let stdout = self.run_checked(&["show", &unit_name(name), &property_arg])?;
        snapshot_from_properties(name, &parse_properties(&stdout))
    }

    fn start(&self, name: &str, timeout: Duration) -> Result<(), ControlError> {
        self.transition("start", name, ServiceStatus::Running, timeout)
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), ControlError> {
        self.transition("stop", name, ServiceStatus::Stopped, timeout)
    }

    fn list_units(&self) -> Result<Vec<String>, ControlError> {
        let stdout = self.run_checked(&[
            "list-unit-files",
            "--type=service",
            "--no-legend",
            "--no-pager",
        ])?;
        Ok(parse_unit_files(&stdout))
    }
}

pub(crate) fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

// `systemctl show` prints one `Key=Value` per line.
fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn status_from_states(active: &str, freezer: &str) -> ServiceStatus {
    match freezer {
        "frozen" => return ServiceStatus::Paused,
        "freezing" => return ServiceStatus::Pausing,
        "thawing" => return ServiceStatus::Continuing,
        _ => {}
    }
    match active {
        "active" | "reloading" => ServiceStatus::Running,
        "inactive" | "failed" => ServiceStatus::Stopped,
        "activating" => ServiceStatus::Starting,
        "deactivating" => ServiceStatus::Stopping,
        _ => ServiceStatus::Unknown,
    }
}

fn snapshot_from_properties(
    name: &str,
    props: &HashMap<String, String>,
) -> Result<UnitSnapshot, ControlError> {
    let get = |key: &str| props.get(key).map(String::as_str).unwrap_or_default();

    if matches!(get("LoadState"), "not-found" | "") {
        return Err(ControlError::NotFound(name.to_string()));
    }

    let mut dependents: Vec<String> = ["RequiredBy", "WantedBy", "BoundBy"]
        .iter()
        .flat_map(|key| get(key).split_whitespace())
        .filter_map(|unit| unit.strip_suffix(".service"))
        .map(str::to_string)
        .collect();
    dependents.sort();
    dependents.dedup();

    Ok(UnitSnapshot {
        name: get("Id")
            .strip_suffix(".service")
            .filter(|id| !id.is_empty())
            .unwrap_or(name)
            .to_string(),
        description: get("Description").to_string(),
        status: status_from_states(get("ActiveState"), get("FreezerState")),
        main_pid: get("MainPID").parse().unwrap_or(0),
        start_type: StartupType::from_unit_file_state(get("UnitFileState")),
        dependents,
    })
}

// Template units (`foo@.service`) cannot be addressed directly and are skipped.
fn parse_unit_files(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|unit| unit.strip_suffix(".service"))
        .filter(|name| !name.is_empty() && !name.ends_with('@'))
        .map(str::to_string)
        .collect()
}
