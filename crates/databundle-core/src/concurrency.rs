use crate::CoreError;
use databundle_store::{BundleLayout, StoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock over one bundle's backing store, released on drop.
///
/// The orchestrator never takes this itself; callers that may run
/// concurrently against the same bundle hold it around each command.
#[derive(Debug)]
pub struct StoreLock {
    lock_file: File,
    path: PathBuf,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl StoreLock {
    /// Block until the lock at `lock_path` is held.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive().map_err(|e| {
            StoreError::LockFailed(format!("{}: {e}", lock_path.display()))
        })?;
        debug!("acquired store lock {}", lock_path.display());
        Ok(Self {
            lock_file: file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Take the lock if nobody else holds it.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: lock_path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    /// Lock the store of the bundle rooted at `bundle_dir`.
    pub fn for_bundle(bundle_dir: &Path) -> Result<Self, CoreError> {
        Self::acquire(&BundleLayout::new(bundle_dir).lock_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_lock_lives_under_build() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::for_bundle(dir.path()).unwrap();
        assert_eq!(lock.path(), dir.path().join("build/.lock"));
        assert!(lock.path().exists());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let _lock = StoreLock::acquire(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        drop(StoreLock::acquire(&lock_path).unwrap());
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_some());
    }
}
