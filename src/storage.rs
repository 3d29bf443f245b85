use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt document {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn join_error(path: &Path, e: tokio::task::JoinError) -> StorageError {
    StorageError::io(path, io::Error::other(e))
}

/// Exclusive advisory lock on a file, shared by every process using the data
/// directory. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub async fn acquire(path: &Path) -> Result<Self, StorageError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = owned.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&owned)
                .map_err(|e| StorageError::io(&owned, e))?;
            FileExt::lock_exclusive(&file).map_err(|e| StorageError::io(&owned, e))?;
            Ok(FileLock { file })
        })
        .await
        .map_err(|e| join_error(path, e))?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Serialize `value` as pretty JSON and replace `path` with it atomically.
///
/// The document goes to a uniquely named temp file in the target's directory,
/// is flushed, then persisted over the target. On failure the temp file is
/// removed and the target is left untouched.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StorageError::io(&dir, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io(&target, e))?;
        // A failed persist drops the temp file, which deletes it.
        tmp.persist(&target)
            .map_err(|e| StorageError::io(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| join_error(path, e))?
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
