//! The durable process lock.
//!
//! A text file holding the decimal pid of the running transcoder. Its
//! presence (with a live pid) is the only source of truth for "streaming is
//! active", across restarts of the supervising program. Writes go through
//! tmp+rename; check-then-act sequences are serialised by an advisory lock on
//! a sibling `.guard` file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::debug;

use crate::utils::fs;
use crate::{Error, Result};

/// Contents of a valid lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLock {
    pub pid: u32,
    /// When the lock was last written.
    pub created_at: DateTime<Utc>,
}

/// Handle to the lock file on disk.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    guard_path: PathBuf,
}

/// Exclusive hold on the guard file. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut guard_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        guard_name.push(".guard");
        let guard_path = path.with_file_name(guard_name);
        Self { path, guard_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the lock.
    ///
    /// `Ok(None)` when no lock exists; [`Error::LockCorrupt`] when the file
    /// does not hold a usable pid.
    pub fn read(&self) -> Result<Option<ProcessLock>> {
        let Some(raw) = fs::read_optional_sync(&self.path)? else {
            return Ok(None);
        };

        let pid = match raw.trim().parse::<u32>() {
            Ok(pid) if pid != 0 => pid,
            _ => {
                return Err(Error::LockCorrupt {
                    path: self.path.clone(),
                    content: raw,
                });
            }
        };

        let created_at = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(ProcessLock { pid, created_at }))
    }

    /// Record `pid` as the running transcoder.
    pub async fn write(&self, pid: u32) -> Result<()> {
        fs::write_atomic(&self.path, pid.to_string().as_bytes()).await?;
        debug!(pid, path = %self.path.display(), "Wrote process lock");
        Ok(())
    }

    /// Remove the lock unconditionally.
    pub fn clear(&self) -> Result<bool> {
        fs::remove_if_exists_sync(&self.path)
    }

    /// Remove the lock only if it still names `pid`, or holds garbage.
    ///
    /// Keeps a lock written by a newer run intact.
    pub fn clear_if(&self, pid: u32) -> Result<bool> {
        match self.read() {
            Ok(Some(lock)) if lock.pid == pid => self.clear(),
            Ok(_) => Ok(false),
            Err(Error::LockCorrupt { .. }) => self.clear(),
            Err(e) => Err(e),
        }
    }

    fn open_guard(&self) -> Result<File> {
        if let Some(parent) = self.guard_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::ensure_dir_all_sync_with_op("creating lock directory", parent)?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.guard_path)
            .map_err(|e| fs::io_error("opening", &self.guard_path, e))
    }

    /// Wait for exclusive access to the lock.
    pub async fn acquire_guard(&self) -> Result<LockGuard> {
        let file = self.open_guard()?;
        let guard_path = self.guard_path.clone();
        tokio::task::spawn_blocking(move || {
            file.lock_exclusive()
                .map(|()| LockGuard { file })
                .map_err(|e| fs::io_error("locking", &guard_path, e))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Take exclusive access if nobody else holds it.
    pub fn try_guard(&self) -> Option<LockGuard> {
        let file = self.open_guard().ok()?;
        file.try_lock_exclusive().ok()?;
        Some(LockGuard { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("stream.pid"));

        assert!(lock.read().unwrap().is_none());

        lock.write(4242).await.unwrap();
        assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), "4242");
        assert_eq!(lock.read().unwrap().map(|l| l.pid), Some(4242));

        assert!(lock.clear().unwrap());
        assert!(!lock.clear().unwrap());
        assert!(lock.read().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("stream.pid"));

        for content in ["", "abc", "-5", "0", "12 34"] {
            std::fs::write(lock.path(), content).unwrap();
            assert!(
                matches!(lock.read(), Err(Error::LockCorrupt { .. })),
                "content {content:?} should be corrupt"
            );
        }

        std::fs::write(lock.path(), " 77\n").unwrap();
        assert_eq!(lock.read().unwrap().map(|l| l.pid), Some(77));
    }

    #[tokio::test]
    async fn test_clear_if_keeps_newer_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("stream.pid"));

        lock.write(100).await.unwrap();
        assert!(!lock.clear_if(99).unwrap());
        assert!(lock.path().exists());
        assert!(lock.clear_if(100).unwrap());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_guard_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("stream.pid"));

        let held = lock.acquire_guard().await.unwrap();
        assert!(lock.try_guard().is_none());
        drop(held);
        assert!(lock.try_guard().is_some());
    }
}
