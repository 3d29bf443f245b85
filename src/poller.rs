use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broadcast::EventPublisher;
use crate::config::MonitorConfig;
use crate::event::{LogEntry, STATUS_TOPIC, STATUS_UPDATED};
use crate::manager::ServiceManager;
use crate::model::{ServiceInfo, ServiceStatus};
use crate::tracker::OperationTracker;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    pub auto_refresh: bool,
    pub expectation_window: Duration,
}

impl PollerSettings {
    pub fn from_config(monitor: &MonitorConfig) -> Self {
        Self {
            interval: monitor.polling_interval(),
            auto_refresh: monitor.auto_refresh,
            expectation_window: monitor.expectation_window(),
        }
    }
}

/// Last status seen per service (case-insensitive), owned by the poll loop.
#[derive(Debug, Default)]
pub struct PollerState {
    last_seen: HashMap<String, ServiceStatus>,
}

impl PollerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, name: &str) -> Option<ServiceStatus> {
        self.last_seen.get(&name.to_ascii_lowercase()).copied()
    }

    fn set(&mut self, name: &str, status: ServiceStatus) {
        self.last_seen.insert(name.to_ascii_lowercase(), status);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub service: ServiceInfo,
    pub old: ServiceStatus,
    pub new: ServiceStatus,
}

/// Compare live statuses to the baseline and advance it.
///
/// A pending expectation replaces the baseline before comparing, so a change
/// caused by our own control operation is not reported.
pub fn reconcile(
    state: &mut PollerState,
    tracker: &OperationTracker,
    window: Duration,
    services: &[ServiceInfo],
) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for service in services {
        if let Some(target) = tracker.consume_target_status(&service.name, window) {
            state.set(&service.name, target);
        }
        if let Some(previous) = state.status_of(&service.name) {
            if previous != service.status {
                changes.push(StatusChange {
                    service: service.clone(),
                    old: previous,
                    new: service.status,
                });
            }
        }
        state.set(&service.name, service.status);
    }
    changes
}

pub struct Poller {
    manager: Arc<ServiceManager>,
    publisher: Arc<dyn EventPublisher>,
    settings: PollerSettings,
}

impl Poller {
    pub fn new(
        manager: Arc<ServiceManager>,
        publisher: Arc<dyn EventPublisher>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            manager,
            publisher,
            settings,
        }
    }

    /// One reconciliation pass. Returns the number of changes reported.
    pub async fn tick(&self, state: &mut PollerState) -> usize {
        let services = self.manager.list_services().await;
        let changes = reconcile(
            state,
            self.manager.tracker(),
            self.settings.expectation_window,
            &services,
        );

        for change in &changes {
            let name = change.service.name.as_str();
            info!(service = name, old = %change.old, new = %change.new, "service status changed");
            let entry = LogEntry::status_change(name, change.old, change.new);
            if let Err(e) = self.manager.audit().append(entry).await {
                error!(service = name, error = %e, "failed to record status change");
            }
            self.publisher.publish(STATUS_TOPIC, STATUS_UPDATED, &change.service);
        }
        debug!(services = services.len(), changes = changes.len(), "poll tick complete");
        changes.len()
    }

    /// Tick, sleep, repeat until cancelled. Ticks are never interrupted; the
    /// token is checked between ticks and while sleeping.
    pub async fn run(self, mut state: PollerState, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            auto_refresh = self.settings.auto_refresh,
            "background poller started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.settings.auto_refresh {
                self.tick(&mut state).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("background poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, LogFilter, DEFAULT_MAX_ENTRIES_PER_FILE};
    use crate::control::memory::{FixedIntrospector, MemoryControl, MemoryRegistrar};
    use crate::control::{ServiceControl, ServiceRegistrar};
    use crate::event::LogType;
    use crate::manager::{Actor, ManagerSettings};
    use crate::model::ServiceDescriptor;
    use crate::monitored::MonitoredSetStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_secs(30);

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String, ServiceInfo)>>,
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, topic: &str, event: &str, payload: &ServiceInfo) {
            self.events
                .lock()
                .unwrap()
                .push((topic.to_string(), event.to_string(), payload.clone()));
        }
    }

    fn info(name: &str, status: ServiceStatus) -> ServiceInfo {
        let mut info = ServiceInfo::from_descriptor(&ServiceDescriptor::new(name));
        info.status = status;
        info
    }

    #[test]
    fn test_reconcile_baseline_then_change() {
        let tracker = OperationTracker::new();
        let mut state = PollerState::new();

        let first = reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Running)]);
        assert!(first.is_empty());

        let second = reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Stopped)]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].old, ServiceStatus::Running);
        assert_eq!(second[0].new, ServiceStatus::Stopped);

        let third = reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Stopped)]);
        assert!(third.is_empty());
    }

    #[test]
    fn test_reconcile_suppresses_expected_transition() {
        let tracker = OperationTracker::new();
        let mut state = PollerState::new();
        reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Stopped)]);

        tracker.register_expected_transition("api", ServiceStatus::Stopped, ServiceStatus::Running);
        let changes = reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Running)]);
        assert!(changes.is_empty());
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_reconcile_reports_divergence_from_expectation() {
        let tracker = OperationTracker::new();
        let mut state = PollerState::new();
        reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Stopped)]);

        // Started, then crashed before the next tick.
        tracker.register_expected_transition("api", ServiceStatus::Stopped, ServiceStatus::Running);
        let changes = reconcile(&mut state, &tracker, WINDOW, &[info("api", ServiceStatus::Stopped)]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, ServiceStatus::Running);
    }

    struct Fixture {
        _dir: TempDir,
        control: Arc<MemoryControl>,
        manager: Arc<ServiceManager>,
        publisher: Arc<RecordingPublisher>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MemoryControl::new().with_unit("api", ServiceStatus::Running));
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
        Fixture {
            _dir: dir,
            control,
            manager,
            publisher: Arc::new(RecordingPublisher::default()),
        }
    }

    fn poller(f: &Fixture, auto_refresh: bool) -> Poller {
        Poller::new(
            Arc::clone(&f.manager),
            Arc::clone(&f.publisher) as Arc<dyn EventPublisher>,
            PollerSettings {
                interval: Duration::from_millis(20),
                auto_refresh,
                expectation_window: WINDOW,
            },
        )
    }

    async fn status_change_count(manager: &ServiceManager) -> usize {
        let filter = LogFilter {
            log_type: Some(LogType::StatusChange),
            ..Default::default()
        };
        manager.get_log_count(&filter).await
    }

    #[tokio::test]
    async fn test_one_notification_per_external_change() {
        let f = fixture().await;
        let poller = poller(&f, true);
        let mut state = PollerState::new();

        assert_eq!(poller.tick(&mut state).await, 0);

        f.control.set_status("api", ServiceStatus::Stopped);
        assert_eq!(poller.tick(&mut state).await, 1);
        assert_eq!(poller.tick(&mut state).await, 0);

        let events = f.publisher.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, STATUS_TOPIC);
        assert_eq!(events[0].1, STATUS_UPDATED);
        assert_eq!(events[0].2.status, ServiceStatus::Stopped);
        assert_eq!(status_change_count(&f.manager).await, 1);
    }

    #[tokio::test]
    async fn test_own_operation_is_not_reported() {
        let f = fixture().await;
        let poller = poller(&f, true);
        let mut state = PollerState::new();
        poller.tick(&mut state).await;

        let result = f.manager.stop("api", &Actor::default()).await;
        assert!(result.success);
        assert_eq!(poller.tick(&mut state).await, 0);

        assert!(f.publisher.events.lock().unwrap().is_empty());
        assert_eq!(status_change_count(&f.manager).await, 0);
        assert_eq!(state.status_of("api"), Some(ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller(&f, true).run(PollerState::new(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        f.control.set_status("api", ServiceStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.publisher.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_refresh_disabled_skips_ticks() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller(&f, false).run(PollerState::new(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = f.control.calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.control.calls(), calls);
        assert_eq!(calls, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
