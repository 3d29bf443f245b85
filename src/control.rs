//! Host service-control facade.
//!
//! All methods are blocking; async callers go through `spawn_blocking`.

#[cfg(test)]
pub mod memory;
pub mod registrar;
mod systemctl;

pub use registrar::{ServiceRegistrar, SystemdRegistrar, UnitSpec};
pub use systemctl::SystemctlControl;

use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::model::{ServiceStatus, StartupType};

pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("service '{0}' is not installed on this host")]
    NotFound(String),
    #[error("service '{0}' is already installed on this host")]
    AlreadyExists(String),
    #[error("unit for '{0}' is not managed by svcwatch")]
    NotManaged(String),
    #[error("timed out after {}s waiting for '{name}' to become {target}", .timeout.as_secs())]
    Timeout {
        name: String,
        target: ServiceStatus,
        timeout: Duration,
    },
    #[error("{0}")]
    Os(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Everything the host reports about one unit in a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSnapshot {
    pub name: String,
    pub description: String,
    pub status: ServiceStatus,
    pub main_pid: u32,
    pub start_type: StartupType,
    pub dependents: Vec<String>,
}

pub trait ServiceControl: Send + Sync {
    fn describe(&self, name: &str) -> Result<UnitSnapshot, ControlError>;

    fn query_status(&self, name: &str) -> Result<ServiceStatus, ControlError> {
        Ok(self.describe(name)?.status)
    }

    fn query_start_type(&self, name: &str) -> Result<String, ControlError> {
        Ok(self.describe(name)?.start_type.to_string())
    }

    /// Returns once the service reports Running, or fails after `timeout`.
    fn start(&self, name: &str, timeout: Duration) -> Result<(), ControlError>;

    /// Returns once the service reports Stopped, or fails after `timeout`.
    fn stop(&self, name: &str, timeout: Duration) -> Result<(), ControlError>;

    /// Names of every installed service unit.
    fn list_units(&self) -> Result<Vec<String>, ControlError>;
}

/// Poll `query_status` until it reports `target` or `timeout` elapses.
pub fn wait_for_status(
    control: &(impl ServiceControl + ?Sized),
    name: &str,
    target: ServiceStatus,
    timeout: Duration,
    interval: Duration,
) -> Result<(), ControlError> {
    let deadline = Instant::now() + timeout;
    loop {
        if control.query_status(name)? == target {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ControlError::Timeout {
                name: name.to_string(),
                target,
                timeout,
            });
        }
        thread::sleep(interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryControl;
    use super::*;

    #[test]
    fn test_wait_for_status_reaches_target() {
        let control = MemoryControl::new().with_unit("api", ServiceStatus::Running);
        wait_for_status(
            &control,
            "api",
            ServiceStatus::Running,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .unwrap();
    }

    #[test]
    fn test_wait_for_status_times_out() {
        let control = MemoryControl::new().with_unit("api", ServiceStatus::Starting);
        let started = Instant::now();
        let err = wait_for_status(
            &control,
            "api",
            ServiceStatus::Running,
            Duration::from_millis(60),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::Timeout { target: ServiceStatus::Running, .. }));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_wait_for_status_propagates_not_found() {
        let control = MemoryControl::new();
        let err = wait_for_status(
            &control,
            "ghost",
            ServiceStatus::Running,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }
}
