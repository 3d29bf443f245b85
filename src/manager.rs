use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, LogFilter};
use crate::config::Config;
use crate::control::{
    ControlError, ServiceControl, ServiceRegistrar, SystemctlControl, SystemdRegistrar, UnitSpec,
};
use crate::diagnostics::{capture_output, resolve_binary_path};
use crate::event::LogEntry;
use crate::introspect::{ProcessIntrospector, ProcfsIntrospector};
use crate::model::{
    validate_service_name, OperationResult, RegistrationRequest, ServiceDefaults,
    ServiceDescriptor, ServiceInfo, ServiceStatus, ValidationError,
};
use crate::monitored::MonitoredSetStore;
use crate::storage::StorageError;
use crate::tracker::OperationTracker;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub whitelist: Vec<ServiceDescriptor>,
    pub operation_timeout: Duration,
    pub diagnostic_timeout: Duration,
    pub require_admin_for_control: bool,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            whitelist: config.monitor.services.clone(),
            operation_timeout: config.monitor.operation_timeout(),
            diagnostic_timeout: config.monitor.diagnostic_timeout(),
            require_admin_for_control: config.monitor.require_admin_for_control,
        }
    }
}

/// Who asked for an operation; recorded on audit entries.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user: Option<String>,
    pub ip: Option<String>,
}

impl Actor {
    /// The invoking local user, for CLI-originated operations.
    pub fn local() -> Self {
        Self {
            user: std::env::var("SUDO_USER")
                .or_else(|_| std::env::var("USER"))
                .ok(),
            ip: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Start,
    Stop,
    Restart,
    Register,
    Unregister,
}

impl Verb {
    fn infinitive(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Restart => "restart",
            Verb::Register => "register",
            Verb::Unregister => "unregister",
        }
    }

    fn past(self) -> &'static str {
        match self {
            Verb::Start => "Started",
            Verb::Stop => "Stopped",
            Verb::Restart => "Restarted",
            Verb::Register => "Registered",
            Verb::Unregister => "Unregistered",
        }
    }
}

#[derive(Debug)]
enum Transition {
    Unchanged(ServiceStatus),
    Changed {
        from: ServiceStatus,
        to: ServiceStatus,
    },
}

/// Control-plane orchestrator: validation, OS calls, expectations, audit.
pub struct ServiceManager {
    control: Arc<dyn ServiceControl>,
    registrar: Arc<dyn ServiceRegistrar>,
    introspector: Arc<dyn ProcessIntrospector>,
    store: MonitoredSetStore,
    tracker: Arc<OperationTracker>,
    audit: AuditLog,
    settings: ManagerSettings,
}

impl ServiceManager {
    pub fn new(
        control: Arc<dyn ServiceControl>,
        registrar: Arc<dyn ServiceRegistrar>,
        introspector: Arc<dyn ProcessIntrospector>,
        store: MonitoredSetStore,
        audit: AuditLog,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            control,
            registrar,
            introspector,
            store,
            tracker: Arc::new(OperationTracker::new()),
            audit,
            settings,
        }
    }

    /// Wire the systemd-backed components from configuration.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        let control: Arc<dyn ServiceControl> = Arc::new(SystemctlControl::new());
        let introspector = Arc::new(ProcfsIntrospector::new(Arc::clone(&control)));
        let audit = AuditLog::open(config.log_dir(), config.monitor.max_logs_per_file).await?;
        Ok(Self::new(
            control,
            Arc::new(SystemdRegistrar::default()),
            introspector,
            MonitoredSetStore::in_dir(&config.data_dir()),
            audit,
            ManagerSettings::from_config(config),
        ))
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ---- control operations ----

    pub async fn start(&self, name: &str, actor: &Actor) -> OperationResult {
        let descriptor = match self.authorize(name).await {
            Ok(d) => d,
            Err(e) => return rejected(e),
        };
        let control = Arc::clone(&self.control);
        let unit = descriptor.name.clone();
        let timeout = self.settings.operation_timeout;
        let outcome = run_blocking(move || {
            let before = control.query_status(&unit)?;
            if before == ServiceStatus::Running {
                return Ok(Transition::Unchanged(before));
            }
            control.start(&unit, timeout)?;
            Ok(Transition::Changed {
                from: before,
                to: ServiceStatus::Running,
            })
        })
        .await;
        self.finish(Verb::Start, &descriptor, actor, outcome).await
    }

    pub async fn stop(&self, name: &str, actor: &Actor) -> OperationResult {
        let descriptor = match self.authorize(name).await {
            Ok(d) => d,
            Err(e) => return rejected(e),
        };
        let control = Arc::clone(&self.control);
        let unit = descriptor.name.clone();
        let timeout = self.settings.operation_timeout;
        let outcome = run_blocking(move || {
            let before = control.query_status(&unit)?;
            if before == ServiceStatus::Stopped {
                return Ok(Transition::Unchanged(before));
            }
            control.stop(&unit, timeout)?;
            Ok(Transition::Changed {
                from: before,
                to: ServiceStatus::Stopped,
            })
        })
        .await;
        self.finish(Verb::Stop, &descriptor, actor, outcome).await
    }

    pub async fn restart(&self, name: &str, actor: &Actor) -> OperationResult {
        let descriptor = match self.authorize(name).await {
            Ok(d) => d,
            Err(e) => return rejected(e),
        };
        let control = Arc::clone(&self.control);
        let unit = descriptor.name.clone();
        let timeout = self.settings.operation_timeout;
        let outcome = run_blocking(move || {
            let before = control.query_status(&unit)?;
            if before == ServiceStatus::Running {
                control.stop(&unit, timeout)?;
            }
            control.start(&unit, timeout)?;
            Ok(Transition::Changed {
                from: before,
                to: ServiceStatus::Running,
            })
        })
        .await;
        self.finish(Verb::Restart, &descriptor, actor, outcome).await
    }

    pub async fn register(&self, request: &RegistrationRequest, actor: &Actor) -> OperationResult {
        let descriptor = match self.authorize(&request.name).await {
            Ok(d) => d,
            Err(e) => return rejected(e),
        };
        let exec_start =
            match resolve_binary_path(&request.binary_path, request.binary_path_alt.as_deref()) {
                Some(path) if path.is_file() => path,
                Some(path) => return rejected(ValidationError::BinaryNotFound(path)),
                None => return rejected(ValidationError::BinaryMissing),
            };

        let defaults = self.store.defaults().await;
        let description = [
            request.display_name.as_str(),
            request.description.as_deref().unwrap_or_default(),
            descriptor.display_name.as_str(),
        ]
        .into_iter()
        .find(|s| !s.trim().is_empty())
        .unwrap_or(descriptor.name.as_str())
        .to_string();
        let spec = UnitSpec {
            name: descriptor.name.clone(),
            description,
            exec_start,
            startup_type: request.startup_type,
            user: request
                .account
                .clone()
                .filter(|a| !a.trim().is_empty())
                .unwrap_or(defaults.account),
            group: defaults.group,
        };

        let control = Arc::clone(&self.control);
        let registrar = Arc::clone(&self.registrar);
        let outcome = run_blocking(move || {
            // Vendor units outside the registrar's directory count too.
            match control.describe(&spec.name) {
                Ok(_) => return Err(ControlError::AlreadyExists(spec.name.clone())),
                Err(ControlError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            registrar.register(&spec)?;
            Ok(Transition::Changed {
                from: ServiceStatus::Unknown,
                to: ServiceStatus::Stopped,
            })
        })
        .await;
        self.finish(Verb::Register, &descriptor, actor, outcome).await
    }

    /// Stop the service if it is running, then remove its unit. Units the
    /// registrar did not create are refused before anything is stopped. A
    /// failed stop does not prevent removal.
    pub async fn unregister(&self, name: &str, actor: &Actor) -> OperationResult {
        let descriptor = match self.authorize(name).await {
            Ok(d) => d,
            Err(e) => return rejected(e),
        };
        let control = Arc::clone(&self.control);
        let registrar = Arc::clone(&self.registrar);
        let unit = descriptor.name.clone();
        let timeout = self.settings.operation_timeout;
        let outcome = run_blocking(move || {
            if !registrar.is_managed(&unit) {
                return Err(ControlError::NotManaged(unit));
            }
            let before = control
                .query_status(&unit)
                .unwrap_or(ServiceStatus::Unknown);
            if before == ServiceStatus::Running {
                if let Err(e) = control.stop(&unit, timeout) {
                    warn!(service = %unit, error = %e, "stop before unregister failed, continuing");
                }
            }
            registrar.unregister(&unit)?;
            Ok(Transition::Changed {
                from: before,
                to: ServiceStatus::Unknown,
            })
        })
        .await;
        self.finish(Verb::Unregister, &descriptor, actor, outcome).await
    }

    // ---- monitored set ----

    /// Add an installed service to the monitored set. Returns false when the
    /// name is invalid, not installed, or already monitored.
    pub async fn add_to_monitoring(
        &self,
        name: &str,
        display_name: Option<&str>,
        description: Option<&str>,
        critical: bool,
        actor: &Actor,
    ) -> Result<bool, StorageError> {
        if let Err(e) = validate_service_name(name) {
            warn!(service = name, error = %e, "refusing to monitor");
            return Ok(false);
        }
        let control = Arc::clone(&self.control);
        let lookup = name.to_string();
        if let Err(e) = run_blocking(move || control.describe(&lookup)).await {
            warn!(service = name, error = %e, "cannot monitor a service that is not installed");
            return Ok(false);
        }
        if self.is_monitored(name).await {
            info!(service = name, "already monitored");
            return Ok(false);
        }

        let descriptor = ServiceDescriptor {
            display_name: display_name
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(name)
                .to_string(),
            description: description.unwrap_or_default().to_string(),
            critical,
            ..ServiceDescriptor::new(name)
        };
        let added = self.store.add(descriptor).await?;
        if added {
            info!(service = name, "added to monitoring");
            self.record(
                LogEntry::operation(name, format!("Added '{name}' to monitoring"), true)
                    .by(actor.user.as_deref(), actor.ip.as_deref()),
            )
            .await;
        }
        Ok(added)
    }

    /// Only runtime-added services can be removed; configured ones stay.
    pub async fn remove_from_monitoring(&self, name: &str, actor: &Actor) -> Result<bool, StorageError> {
        if !self.store.exists(name).await {
            if self.settings.whitelist.iter().any(|d| d.matches(name)) {
                warn!(service = name, "configured in config.toml, cannot remove at runtime");
            } else {
                debug!(service = name, "not in monitored set");
            }
            return Ok(false);
        }
        let removed = self.store.remove(name).await?;
        if removed {
            info!(service = name, "removed from monitoring");
            self.record(
                LogEntry::operation(name, format!("Removed '{name}' from monitoring"), true)
                    .by(actor.user.as_deref(), actor.ip.as_deref()),
            )
            .await;
        }
        Ok(removed)
    }

    pub async fn is_monitored(&self, name: &str) -> bool {
        self.settings.whitelist.iter().any(|d| d.matches(name)) || self.store.exists(name).await
    }

    /// Configured services first, then runtime additions not already listed.
    pub async fn monitored_descriptors(&self) -> Vec<ServiceDescriptor> {
        let mut all = self.settings.whitelist.clone();
        for descriptor in self.store.list_all().await {
            if !all.iter().any(|d| d.matches(&descriptor.name)) {
                all.push(descriptor);
            }
        }
        all
    }

    // ---- queries ----

    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        let descriptors = self.monitored_descriptors().await;
        join_all(
            descriptors
                .into_iter()
                .map(|d| self.build_info(d.name.clone(), Some(d))),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    pub async fn get_service(&self, name: &str) -> Option<ServiceInfo> {
        if validate_service_name(name).is_err() {
            return None;
        }
        let descriptor = self.find_descriptor(name).await;
        let lookup = descriptor
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| name.to_string());
        self.build_info(lookup, descriptor).await
    }

    /// Every installed service, annotated with monitored-set metadata.
    pub async fn list_installed(&self) -> Vec<ServiceInfo> {
        let control = Arc::clone(&self.control);
        let units = match run_blocking(move || control.list_units()).await {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, "failed to enumerate installed services");
                return Vec::new();
            }
        };
        let descriptors = self.monitored_descriptors().await;
        join_all(units.into_iter().map(|unit| {
            let descriptor = descriptors.iter().find(|d| d.matches(&unit)).cloned();
            self.build_info(unit, descriptor)
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    pub async fn service_defaults(&self) -> ServiceDefaults {
        self.store.defaults().await
    }

    pub async fn save_service_defaults(&self, defaults: ServiceDefaults) -> Result<(), StorageError> {
        self.store.save_defaults(defaults).await
    }

    pub async fn get_logs(&self, filter: &LogFilter, skip: usize, take: usize) -> Vec<LogEntry> {
        self.audit.query(filter, skip, take).await
    }

    pub async fn get_log_count(&self, filter: &LogFilter) -> usize {
        self.audit.count(filter).await
    }

    // ---- internals ----

    async fn find_descriptor(&self, name: &str) -> Option<ServiceDescriptor> {
        if let Some(d) = self.settings.whitelist.iter().find(|d| d.matches(name)) {
            return Some(d.clone());
        }
        self.store.list_all().await.into_iter().find(|d| d.matches(name))
    }

    // Checks that run before any OS call.
    async fn authorize(&self, name: &str) -> Result<ServiceDescriptor, ValidationError> {
        validate_service_name(name)?;
        let descriptor = self
            .find_descriptor(name)
            .await
            .ok_or_else(|| ValidationError::NotMonitored(name.to_string()))?;
        if self.settings.require_admin_for_control && !is_root() {
            return Err(ValidationError::NotPermitted);
        }
        Ok(descriptor)
    }

    async fn build_info(&self, name: String, descriptor: Option<ServiceDescriptor>) -> Option<ServiceInfo> {
        let control = Arc::clone(&self.control);
        let introspector = Arc::clone(&self.introspector);
        let lookup = name.clone();
        let fallback = descriptor.clone();
        let collected = run_blocking(move || {
            collect_info(control.as_ref(), introspector.as_ref(), &lookup, descriptor.as_ref())
        })
        .await;
        match collected {
            Ok(info) => Some(info),
            Err(ControlError::NotFound(_)) => fallback.as_ref().map(ServiceInfo::unregistered),
            Err(e) => {
                warn!(service = %name, error = %e, "failed to query service");
                fallback.as_ref().map(ServiceInfo::from_descriptor)
            }
        }
    }

    async fn finish(
        &self,
        verb: Verb,
        descriptor: &ServiceDescriptor,
        actor: &Actor,
        outcome: Result<Transition, ControlError>,
    ) -> OperationResult {
        let name = descriptor.name.as_str();
        match outcome {
            Ok(Transition::Unchanged(status)) => {
                let message = format!("Service '{name}' is already {}", status.as_str().to_lowercase());
                info!(service = name, verb = verb.infinitive(), "{message}");
                self.record(
                    LogEntry::operation(name, message.clone(), true)
                        .by(actor.user.as_deref(), actor.ip.as_deref()),
                )
                .await;
                OperationResult::success(message).with_info(self.get_service(name).await)
            }
            Ok(Transition::Changed { from, to }) => {
                self.tracker.register_expected_transition(name, from, to);
                let message = format!("{} '{name}' ({from} -> {to})", verb.past());
                info!(service = name, %from, %to, "{}", verb.past());
                self.record(
                    LogEntry::operation(name, message.clone(), true)
                        .by(actor.user.as_deref(), actor.ip.as_deref()),
                )
                .await;
                OperationResult::success(message).with_info(self.get_service(name).await)
            }
            Err(e) => {
                error!(service = name, verb = verb.infinitive(), error = %e, "operation failed");
                let diagnostic = self.diagnose(descriptor).await;
                let detail = if diagnostic.is_empty() { e.to_string() } else { diagnostic };
                let message = format!("Failed to {} '{name}': {detail}", verb.infinitive());
                self.record(
                    LogEntry::operation(name, message.clone(), false)
                        .by(actor.user.as_deref(), actor.ip.as_deref()),
                )
                .await;
                OperationResult::failure(message)
            }
        }
    }

    async fn diagnose(&self, descriptor: &ServiceDescriptor) -> String {
        match resolve_binary_path(&descriptor.binary_path, descriptor.binary_path_alt.as_deref()) {
            Some(binary) => capture_output(&binary, self.settings.diagnostic_timeout).await,
            None => String::new(),
        }
    }

    // Audit failures never change the outcome of an operation.
    async fn record(&self, entry: LogEntry) {
        if let Err(e) = self.audit.append(entry).await {
            error!(error = %e, "failed to write audit entry");
        }
    }
}

fn rejected(e: ValidationError) -> OperationResult {
    warn!(error = %e, "operation rejected");
    OperationResult::failure(e.to_string())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

async fn run_blocking<T, F>(f: F) -> Result<T, ControlError>
where
    F: FnOnce() -> Result<T, ControlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(ControlError::Os(format!("control task failed: {e}"))))
}

fn collect_info(
    control: &dyn ServiceControl,
    introspector: &dyn ProcessIntrospector,
    name: &str,
    descriptor: Option<&ServiceDescriptor>,
) -> Result<ServiceInfo, ControlError> {
    let snapshot = control.describe(name)?;
    let mut info = match descriptor {
        Some(d) => ServiceInfo::from_descriptor(d),
        None => ServiceInfo::from_descriptor(&ServiceDescriptor::new(snapshot.name.as_str())),
    };
    if !snapshot.description.is_empty() {
        info.display_name = snapshot.description.clone();
    }
    info.status = snapshot.status;
    info.startup_type = snapshot.start_type.to_string();
    info.process_id = snapshot.main_pid;

    if snapshot.status == ServiceStatus::Running && snapshot.main_pid > 0 {
        if let Some(uptime) = introspector.uptime(snapshot.main_pid) {
            info.uptime_secs = uptime.as_secs();
            info.last_status_change = Some(OffsetDateTime::now_utc() - uptime);
        }
        info.memory_usage_mb = introspector.memory_mb(snapshot.main_pid).unwrap_or_default();
    }
    info.dependent_services_count = snapshot.dependents.len();
    Ok(info)
}
