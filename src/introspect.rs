use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::control::ServiceControl;

/// Best-effort process metrics. `None` means the data was unavailable.
pub trait ProcessIntrospector: Send + Sync {
    fn uptime(&self, pid: u32) -> Option<Duration>;
    fn memory_mb(&self, pid: u32) -> Option<f64>;
    fn dependent_service_count(&self, name: &str) -> Option<usize>;
}

/// Reads process data from procfs and dependents from the service facade.
pub struct ProcfsIntrospector {
    proc_root: PathBuf,
    control: Arc<dyn ServiceControl>,
}

impl ProcfsIntrospector {
    pub fn new(control: Arc<dyn ServiceControl>) -> Self {
        Self::with_root("/proc", control)
    }

    pub fn with_root(proc_root: impl Into<PathBuf>, control: Arc<dyn ServiceControl>) -> Self {
        Self {
            proc_root: proc_root.into(),
            control,
        }
    }

    fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.proc_root.join(relative)).ok()
    }
}

impl ProcessIntrospector for ProcfsIntrospector {
    fn uptime(&self, pid: u32) -> Option<Duration> {
        if pid == 0 {
            return None;
        }
        let start_ticks = parse_start_ticks(&self.read(&format!("{pid}/stat"))?)?;
        let system_uptime = parse_uptime_secs(&self.read("uptime")?)?;
        let started_at = start_ticks as f64 / clock_ticks_per_second();
        let secs = system_uptime - started_at;
        (secs >= 0.0).then(|| Duration::from_secs_f64(secs))
    }

    fn memory_mb(&self, pid: u32) -> Option<f64> {
        if pid == 0 {
            return None;
        }
        let kb = parse_vm_rss_kb(&self.read(&format!("{pid}/status"))?)?;
        Some((kb as f64 / 1024.0 * 100.0).round() / 100.0)
    }

    fn dependent_service_count(&self, name: &str) -> Option<usize> {
        self.control.describe(name).ok().map(|s| s.dependents.len())
    }
}

fn clock_ticks_per_second() -> f64 {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { 100.0 } else { v as f64 }
}

// Field 22 of /proc/<pid>/stat. The command name may contain spaces and
// parentheses, so fields are counted from the last ')'.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let after = stat.get(stat.rfind(')')? + 1..)?;
    after.split_whitespace().nth(19)?.parse().ok()
}

fn parse_uptime_secs(uptime: &str) -> Option<f64> {
    uptime.split_whitespace().next()?.parse().ok()
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::memory::MemoryControl;
    use crate::model::ServiceStatus;
    use tempfile::TempDir;

    const STAT: &str = "4242 (my (odd) svc) S 1 4242 4242 0 -1 4194560 1 0 0 0 3 2 0 0 20 0 1 0 500 12345 67 18446744073709551615";

    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("4242")).unwrap();
        std::fs::write(dir.path().join("4242/stat"), STAT).unwrap();
        std::fs::write(
            dir.path().join("4242/status"),
            "Name:\tsvc\nVmPeak:\t  9000 kB\nVmRSS:\t  5120 kB\nThreads:\t1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("uptime"), "1000.50 3900.10\n").unwrap();
        dir
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_start_ticks(STAT), Some(500));
        assert_eq!(parse_start_ticks("garbage"), None);
        assert_eq!(parse_uptime_secs("12.5 40.0"), Some(12.5));
        assert_eq!(parse_vm_rss_kb("VmRSS:\t  2048 kB\n"), Some(2048));
        assert_eq!(parse_vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_procfs_metrics() {
        let proc_root = fake_proc();
        let control = Arc::new(MemoryControl::new().with_unit("api", ServiceStatus::Running));
        let introspector = ProcfsIntrospector::with_root(proc_root.path(), control);

        let uptime = introspector.uptime(4242).unwrap();
        let expected = 1000.5 - 500.0 / clock_ticks_per_second();
        assert!((uptime.as_secs_f64() - expected).abs() < 0.01);

        assert_eq!(introspector.memory_mb(4242), Some(5.0));
        assert_eq!(introspector.uptime(0), None);
        assert_eq!(introspector.memory_mb(9999), None);
    }

    #[test]
    fn test_dependent_count() {
        let control = Arc::new(
            MemoryControl::new()
                .with_unit("db", ServiceStatus::Running)
                .with_dependents("db", &["api", "worker"]),
        );
        let introspector = ProcfsIntrospector::with_root("/nonexistent", control);
        assert_eq!(introspector.dependent_service_count("db"), Some(2));
        assert_eq!(introspector.dependent_service_count("ghost"), None);
    }
}
