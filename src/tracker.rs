use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::model::ServiceStatus;

pub const DEFAULT_EXPECTATION_WINDOW: Duration = Duration::from_secs(30);

/// Remembers the status a control operation is expected to produce, so the
/// poller does not report it as an unexpected change.
///
/// At most one expectation is held per service; names are case-insensitive.
#[derive(Debug, Default)]
pub struct OperationTracker {
    targets: DashMap<String, (ServiceStatus, Instant)>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_expected_transition(&self, name: &str, from: ServiceStatus, to: ServiceStatus) {
        debug!(service = name, %from, %to, "registered expected transition");
        self.targets.insert(key(name), (to, Instant::now()));
    }

    /// Remove the expectation for `name`, returning its target only when it
    /// was registered within `within`. Stale entries are dropped either way.
    pub fn consume_target_status(&self, name: &str, within: Duration) -> Option<ServiceStatus> {
        self.consume_target_status_at(name, within, Instant::now())
    }

    fn consume_target_status_at(
        &self,
        name: &str,
        within: Duration,
        now: Instant,
    ) -> Option<ServiceStatus> {
        let (_, (target, registered)) = self.targets.remove(&key(name))?;
        if now.saturating_duration_since(registered) <= within {
            Some(target)
        } else {
            debug!(service = name, "discarded stale expectation");
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.targets.len()
    }
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}
