use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::event::{LogEntry, LogType};
use crate::storage::{self, FileLock, StorageError};

pub const LOG_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_MAX_ENTRIES_PER_FILE: usize = 10_000;
pub const LOG_DIR: &str = "logs";

const FILE_PREFIX: &str = "logs_";
const FILE_EXTENSION: &str = ".json";
const LOCK_FILE_NAME: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogDocument {
    #[serde(default)]
    logs: Vec<LogEntry>,
    #[serde(default = "format_version")]
    version: u32,
}

fn format_version() -> u32 {
    LOG_FORMAT_VERSION
}

impl Default for LogDocument {
    fn default() -> Self {
        Self {
            logs: Vec::new(),
            version: LOG_FORMAT_VERSION,
        }
    }
}

/// Selects entries by type and by inclusive UTC calendar dates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub log_type: Option<LogType>,
    pub start_date: Option<Date>,
    pub end_date: Option<Date>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if self.log_type.is_some_and(|t| t != entry.log_type) {
            return false;
        }
        self.covers_day(utc_day(entry.timestamp))
    }

    fn covers_day(&self, day: Date) -> bool {
        self.start_date.is_none_or(|start| day >= start)
            && self.end_date.is_none_or(|end| day <= end)
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
}

fn utc_day(timestamp: OffsetDateTime) -> Date {
    timestamp.to_offset(UtcOffset::UTC).date()
}

// A day's partition: `logs_YYYYMMDD.json`, then `logs_YYYYMMDD_01.json`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PartitionId {
    day: Date,
    sequence: u32,
}

impl PartitionId {
    fn file_name(&self) -> String {
        let day = self
            .day
            .format(format_description!("[year][month][day]"))
            .unwrap_or_default();
        if self.sequence == 0 {
            format!("{FILE_PREFIX}{day}{FILE_EXTENSION}")
        } else {
            format!("{FILE_PREFIX}{day}_{:02}{FILE_EXTENSION}", self.sequence)
        }
    }

    fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_EXTENSION)?;
        let (day, sequence) = match stem.split_once('_') {
            Some((day, seq)) => (day, seq.parse().ok()?),
            None => (stem, 0),
        };
        let day = Date::parse(day, format_description!("[year][month][day]")).ok()?;
        Some(Self { day, sequence })
    }

    fn next(&self) -> Self {
        Self {
            day: self.day,
            sequence: self.sequence + 1,
        }
    }
}

/// Append-only audit log, partitioned by UTC day with a per-file entry cap.
///
/// Clones share the same directory and lock. Writers also take an advisory
/// lock on `<dir>/.lock`, so separate handles and processes appending to one
/// directory never lose entries.
#[derive(Clone)]
pub struct AuditLog {
    dir: Arc<PathBuf>,
    max_entries_per_file: usize,
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub async fn open(dir: impl Into<PathBuf>, max_entries_per_file: usize) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            dir: Arc::new(dir),
            max_entries_per_file: max_entries_per_file.max(1),
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn lock_dir(&self) -> Result<FileLock, StorageError> {
        FileLock::acquire(&self.dir.join(LOCK_FILE_NAME)).await
    }

    pub async fn append(&self, entry: LogEntry) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let _dir_lock = self.lock_dir().await?;
        let day = utc_day(entry.timestamp);

        let (id, mut document) = match self.partitions_for(|d| d == day).last() {
            Some(&(latest, ref path)) => match storage::read_json::<LogDocument>(path).await {
                Ok(Some(doc)) if doc.logs.len() < self.max_entries_per_file => (latest, doc),
                Ok(Some(_)) => (latest.next(), LogDocument::default()),
                Ok(None) => (latest, LogDocument::default()),
                Err(e) => {
                    // Never overwrite a partition we could not read.
                    warn!(error = %e, "unreadable log partition, rolling over");
                    (latest.next(), LogDocument::default())
                }
            },
            None => (PartitionId { day, sequence: 0 }, LogDocument::default()),
        };

        document.logs.push(entry);
        let path = self.dir.join(id.file_name());
        storage::write_json_atomic(&path, &document).await?;
        debug!(file = %id.file_name(), entries = document.logs.len(), "appended audit entry");
        Ok(())
    }

    /// Matching entries, newest first, after skipping `skip` and keeping at
    /// most `take`.
    pub async fn query(&self, filter: &LogFilter, skip: usize, take: usize) -> Vec<LogEntry> {
        let mut entries = self.load_matching(filter).await;
        // Reverse first so the stable sort puts later-appended entries first on ties.
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.into_iter().skip(skip).take(take).collect()
    }

    pub async fn count(&self, filter: &LogFilter) -> usize {
        self.load_matching(filter).await.len()
    }

    /// Delete partitions dated before today minus `keep_days`. Returns the
    /// number of files removed.
    pub async fn prune_older_than(&self, keep_days: u32) -> usize {
        let cutoff = utc_day(OffsetDateTime::now_utc()) - Duration::days(i64::from(keep_days));
        let _guard = self.lock.lock().await;
        let _dir_lock = match self.lock_dir().await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "could not lock audit directory, skipping prune");
                return 0;
            }
        };

        let mut removed = 0;
        for (id, path) in self.partitions_for(|day| day < cutoff) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(file = %id.file_name(), "removed expired audit partition");
                    removed += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "failed to remove audit partition"),
            }
        }
        removed
    }

    async fn load_matching(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let _guard = self.lock.lock().await;
        let mut entries = Vec::new();
        for (_, path) in self.partitions_for(|day| filter.covers_day(day)) {
            match storage::read_json::<LogDocument>(&path).await {
                Ok(Some(doc)) => entries.extend(doc.logs.into_iter().filter(|e| filter.matches(e))),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping unreadable log partition"),
            }
        }
        entries
    }

    // Partition files whose day satisfies `keep`, in (day, sequence) order.
    fn partitions_for(&self, keep: impl Fn(Date) -> bool) -> Vec<(PartitionId, PathBuf)> {
        let pattern = format!(
            "{}/{FILE_PREFIX}*{FILE_EXTENSION}",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "invalid log glob pattern");
                return Vec::new();
            }
        };

        let mut partitions: Vec<_> = paths
            .filter_map(Result::ok)
            .filter_map(|path| {
                let id = PartitionId::parse(path.file_name()?.to_str()?)?;
                keep(id.day).then_some((id, path))
            })
            .collect();
        partitions.sort_by_key(|(id, _)| *id);
        partitions
    }
}
