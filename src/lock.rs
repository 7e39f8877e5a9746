//! One run per command at a time

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another '{name}' run holds {}", path.display())]
    AlreadyLocked { name: String, path: PathBuf },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive OS lock on `<dir>/dagcargo-<name>.lock`, released on drop
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, LockError> {
        let path = dir.join(format!("dagcargo-{name}.lock"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(TryLockError::WouldBlock) => Err(LockError::AlreadyLocked {
                name: name.to_string(),
                path,
            }),
            Err(TryLockError::Error(e)) => Err(io_err(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let held = RunLock::acquire(dir.path(), "pin-dags").unwrap();
        assert!(held.path().ends_with("dagcargo-pin-dags.lock"));

        let err = RunLock::acquire(dir.path(), "pin-dags").unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { ref name, .. } if name == "pin-dags"));

        // other commands are independent
        RunLock::acquire(dir.path(), "export-status").unwrap();
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        drop(RunLock::acquire(dir.path(), "export-status").unwrap());
        RunLock::acquire(dir.path(), "export-status").unwrap();
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunLock::acquire(&dir.path().join("absent"), "pin-dags").unwrap_err();
        assert!(matches!(err, LockError::Io { .. }));
    }
}
