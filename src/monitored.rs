use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::model::{ServiceDefaults, ServiceDescriptor};
use crate::storage::{self, FileLock, StorageError};

pub const MONITORED_FILE: &str = "monitored-services.json";

// On-disk document. Older files are a bare `{"services": [...]}` and still load.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitoredFile {
    #[serde(default)]
    service_defaults: ServiceDefaults,
    #[serde(default)]
    services: Vec<ServiceDescriptor>,
}

/// Durable list of services added at runtime, plus registration defaults.
///
/// Cloning is cheap and all clones share one lock. Writes also hold an
/// advisory lock on `<file>.lock`, so read-modify-writes from other handles
/// and processes are serialized too.
#[derive(Clone)]
pub struct MonitoredSetStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl MonitoredSetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(MONITORED_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock_file(&self) -> Result<FileLock, StorageError> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        FileLock::acquire(Path::new(&name)).await
    }

    pub async fn list_all(&self) -> Vec<ServiceDescriptor> {
        let _guard = self.lock.lock().await;
        self.load().await.services
    }

    pub async fn exists(&self, name: &str) -> bool {
        let _guard = self.lock.lock().await;
        self.load().await.services.iter().any(|s| s.matches(name))
    }

    /// Returns false, without writing, when the name is already present.
    pub async fn add(&self, descriptor: ServiceDescriptor) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut file = self.load().await;
        if file.services.iter().any(|s| s.matches(&descriptor.name)) {
            debug!(service = %descriptor.name, "already in monitored set");
            return Ok(false);
        }
        file.services.push(descriptor);
        storage::write_json_atomic(&self.path, &file).await?;
        Ok(true)
    }

    pub async fn remove(&self, name: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut file = self.load().await;
        let before = file.services.len();
        file.services.retain(|s| !s.matches(name));
        if file.services.len() == before {
            return Ok(false);
        }
        storage::write_json_atomic(&self.path, &file).await?;
        Ok(true)
    }

    /// Replace the service list, keeping the stored defaults.
    pub async fn save_all(&self, services: Vec<ServiceDescriptor>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut file = self.load().await;
        file.services = services;
        storage::write_json_atomic(&self.path, &file).await
    }

    pub async fn defaults(&self) -> ServiceDefaults {
        let _guard = self.lock.lock().await;
        self.load().await.service_defaults
    }

    pub async fn save_defaults(&self, defaults: ServiceDefaults) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut file = self.load().await;
        file.service_defaults = defaults;
        storage::write_json_atomic(&self.path, &file).await
    }

    // Caller must hold the lock.
    async fn load(&self) -> MonitoredFile {
        match storage::read_json::<MonitoredFile>(&self.path).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!(path = %self.path.display(), "monitored set not found, starting empty");
                MonitoredFile::default()
            }
            Err(e) => {
                warn!(error = %e, "failed to load monitored set, treating as empty");
                MonitoredFile::default()
            }
        }
    }
}
