//! In-memory facade, registrar and introspector used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ControlError, ServiceControl, ServiceRegistrar, UnitSnapshot, UnitSpec};
use crate::introspect::ProcessIntrospector;
use crate::model::{ServiceStatus, StartupType};

#[derive(Debug, Clone)]
struct MemoryUnit {
    status: ServiceStatus,
    pid: u32,
    start_type: StartupType,
    description: String,
    dependents: Vec<String>,
    fail_with: Option<String>,
    stuck: bool,
}

impl MemoryUnit {
    fn new(status: ServiceStatus) -> Self {
        Self {
            status,
            pid: 0,
            start_type: StartupType::Manual,
            description: String::new(),
            dependents: Vec::new(),
            fail_with: None,
            stuck: false,
        }
    }
}

/// Units keyed by exact name. Every facade call increments `calls`.
#[derive(Debug, Default)]
pub struct MemoryControl {
    units: Mutex<HashMap<String, MemoryUnit>>,
    calls: AtomicUsize,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(self, name: &str, status: ServiceStatus) -> Self {
        self.insert(name, status);
        self
    }

    pub fn with_dependents(self, name: &str, dependents: &[&str]) -> Self {
        self.edit(name, |u| {
            u.dependents = dependents.iter().map(|d| d.to_string()).collect()
        });
        self
    }

    pub fn insert(&self, name: &str, status: ServiceStatus) {
        let mut unit = MemoryUnit::new(status);
        if status == ServiceStatus::Running {
            unit.pid = 4242;
        }
        self.units.lock().unwrap().insert(name.to_string(), unit);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.units.lock().unwrap().remove(name).is_some()
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus) {
        self.edit(name, |u| u.status = status);
    }

    pub fn status_of(&self, name: &str) -> Option<ServiceStatus> {
        self.units.lock().unwrap().get(name).map(|u| u.status)
    }

    /// Make start/stop fail with an OS error carrying `message`.
    pub fn fail_with(&self, name: &str, message: &str) {
        self.edit(name, |u| u.fail_with = Some(message.to_string()));
    }

    /// Make start/stop never reach the target status.
    pub fn stuck(&self, name: &str) {
        self.edit(name, |u| u.stuck = true);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn edit(&self, name: &str, f: impl FnOnce(&mut MemoryUnit)) {
        if let Some(unit) = self.units.lock().unwrap().get_mut(name) {
            f(unit);
        }
    }

    fn transition(
        &self,
        name: &str,
        target: ServiceStatus,
        pending: ServiceStatus,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut units = self.units.lock().unwrap();
        let unit = units
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        if let Some(message) = &unit.fail_with {
            return Err(ControlError::Os(message.clone()));
        }
        if unit.stuck {
            unit.status = pending;
            return Err(ControlError::Timeout {
                name: name.to_string(),
                target,
                timeout,
            });
        }
        unit.status = target;
        unit.pid = if target == ServiceStatus::Running { 4242 } else { 0 };
        Ok(())
    }
}

impl ServiceControl for MemoryControl {
    fn describe(&self, name: &str) -> Result<UnitSnapshot, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let units = self.units.lock().unwrap();
        let unit = units
            .get(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        Ok(UnitSnapshot {
            name: name.to_string(),
            description: unit.description.clone(),
            status: unit.status,
            main_pid: unit.pid,
            start_type: unit.start_type,
            dependents: unit.dependents.clone(),
        })
    }

    fn start(&self, name: &str, timeout: Duration) -> Result<(), ControlError> {
        self.transition(name, ServiceStatus::Running, ServiceStatus::Starting, timeout)
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), ControlError> {
        self.transition(name, ServiceStatus::Stopped, ServiceStatus::Stopping, timeout)
    }

    fn list_units(&self) -> Result<Vec<String>, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut names: Vec<_> = self.units.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Registers units into a shared `MemoryControl`.
pub struct MemoryRegistrar {
    control: Arc<MemoryControl>,
    pub registered: Mutex<Vec<UnitSpec>>,
}

impl MemoryRegistrar {
    pub fn new(control: Arc<MemoryControl>) -> Self {
        Self {
            control,
            registered: Mutex::new(Vec::new()),
        }
    }
}

impl ServiceRegistrar for MemoryRegistrar {
    fn register(&self, spec: &UnitSpec) -> Result<(), ControlError> {
        if self.control.status_of(&spec.name).is_some() {
            return Err(ControlError::Os(format!("unit '{}' already exists", spec.name)));
        }
        self.control.insert(&spec.name, ServiceStatus::Stopped);
        self.control.edit(&spec.name, |u| {
            u.start_type = spec.startup_type;
            u.description = spec.description.clone();
        });
        self.registered.lock().unwrap().push(spec.clone());
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<(), ControlError> {
        if !self.is_managed(name) {
            return Err(ControlError::NotManaged(name.to_string()));
        }
        self.registered.lock().unwrap().retain(|s| !s.name.eq_ignore_ascii_case(name));
        self.control.remove(name);
        Ok(())
    }

    fn is_managed(&self, name: &str) -> bool {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// Fixed metrics for any non-zero pid.
pub struct FixedIntrospector;

impl ProcessIntrospector for FixedIntrospector {
    fn uptime(&self, pid: u32) -> Option<Duration> {
        (pid > 0).then(|| Duration::from_secs(120))
    }

    fn memory_mb(&self, pid: u32) -> Option<f64> {
        (pid > 0).then_some(12.5)
    }

    fn dependent_service_count(&self, _name: &str) -> Option<usize> {
        None
    }
}
