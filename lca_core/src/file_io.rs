//! # File I/O Module
//!
//! Filesystem helpers for export partitions and configuration files:
//! - **Atomic writes**: write to `.tmp`, fsync, rename, so readers never see a partial object
//! - **Partition locking**: one writer per export partition across processes
//!
//! The lock is an fs2 advisory lock on a `.lock` file next to the locked
//! path. The file stays on disk after release; only the OS lock matters, so
//! a crashed writer never leaves a partition locked.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lca_core::file_io::{write_atomic, FileLock};
//! use std::path::Path;
//!
//! let partition = Path::new("export/lca/P-001/.partition");
//! let lock = FileLock::acquire(partition).unwrap();
//! write_atomic(Path::new("export/lca/P-001/snapshot.json"), b"{}").unwrap();
//! drop(lock);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;

use crate::errors::{EngineError, EngineResult};

/// Exclusive partition lock, released on drop.
pub struct FileLock {
    target: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock on `path` without blocking.
    ///
    /// Returns `EngineError::FileLocked` (recoverable) while another handle
    /// holds it, in this process or another one.
    pub fn acquire(path: &Path) -> EngineResult<Self> {
        let lock_path = lock_path_for(path);
        // Never truncate or delete: a waiter may already hold this inode open.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| EngineError::file_error("open lock", lock_path.display().to_string(), e.to_string()))?;

        file.try_lock_exclusive()
            .map_err(|_| EngineError::file_locked(path.display().to_string(), "another exporter", "unknown"))?;

        Ok(FileLock {
            target: path.to_path_buf(),
            file,
        })
    }

    /// Locked path
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    let extension = lock_path
        .extension()
        .map(|e| format!("{}.lock", e.to_string_lossy()))
        .unwrap_or_else(|| "lock".to_string());
    lock_path.set_extension(extension);
    lock_path
}

/// Write `bytes` to `path` atomically.
///
/// Writes `<path>.tmp`, syncs it, then renames it over `path`. Parent
/// directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::file_error("create directory", parent.display().to_string(), e.to_string()))?;
        }
    }

    let tmp_path = tmp_path_for(path);
    let mut tmp_file = File::create(&tmp_path)
        .map_err(|e| EngineError::file_error("create temp file", tmp_path.display().to_string(), e.to_string()))?;
    tmp_file
        .write_all(bytes)
        .map_err(|e| EngineError::file_error("write temp file", tmp_path.display().to_string(), e.to_string()))?;
    tmp_file
        .sync_all()
        .map_err(|e| EngineError::file_error("sync temp file", tmp_path.display().to_string(), e.to_string()))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        EngineError::file_error("rename to final", path.display().to_string(), e.to_string())
    })?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Read a whole file as UTF-8
pub fn read_to_string(path: &Path) -> EngineResult<String> {
    let mut file =
        File::open(path).map_err(|e| EngineError::file_error("open", path.display().to_string(), e.to_string()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| EngineError::file_error("read", path.display().to_string(), e.to_string()))?;
    Ok(contents)
}

/// Read and parse a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let contents = read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| EngineError::SerializationError {
        reason: format!("Invalid JSON in {}: {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;

    fn temp_path(name: &str) -> PathBuf {
        temp_dir().join(format!("lca_core_test_{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_lock_path_generation() {
        assert_eq!(
            lock_path_for(Path::new("/export/lca/P-1/.partition")),
            Path::new("/export/lca/P-1/.partition.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("/export/snapshot.json")),
            Path::new("/export/snapshot.json.lock")
        );
    }

    #[test]
    fn test_write_atomic_leaves_no_tmp_file() {
        let dir = temp_path("atomic");
        let path = dir.join("nested").join("object.json");
        write_atomic(&path, br#"{"rows": 3}"#).unwrap();

        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["rows"], 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_lock_is_exclusive_until_dropped() {
        let dir = temp_path("lock");
        fs::create_dir_all(&dir).unwrap();
        let target = dir.join(".partition");

        let lock = FileLock::acquire(&target).unwrap();
        assert_eq!(lock.target(), target.as_path());

        let err = FileLock::acquire(&target).err().unwrap();
        assert_eq!(err.error_code(), "FILE_LOCKED");
        assert!(err.is_recoverable());

        drop(lock);
        let again = FileLock::acquire(&target).unwrap();
        drop(again);
        assert!(lock_path_for(&target).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_read_json_reports_path() {
        let dir = temp_path("badjson");
        let path = dir.join("bad.json");
        write_atomic(&path, b"not json").unwrap();
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
        let _ = fs::remove_dir_all(&dir);
    }
}
