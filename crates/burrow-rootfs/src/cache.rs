//! Content-addressed extraction cache with cross-process locking.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::digest;
use crate::error::RootfsError;
use crate::extract;

/// Sentinel file whose presence certifies a cache entry as fully extracted.
pub const COMPLETION_MARKER: &str = ".burrow-complete";

/// How long to wait on another process's extraction before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Maps archive content digests to extracted rootfs directories.
///
/// Entries are created on first use and never deleted by the engine;
/// reclaiming disk space is the operator's concern (`clear`, or the CLI's
/// `clear-cache`).
#[derive(Debug, Clone)]
pub struct RootfsCache {
    root: PathBuf,
}

impl RootfsCache {
    /// Cache rooted at the per-user cache directory
    /// (`~/.cache/burrow/rootfs` on Linux).
    pub fn new() -> Result<Self, RootfsError> {
        let dirs = directories::ProjectDirs::from("", "", "burrow")
            .ok_or_else(|| RootfsError::CacheRoot("no home directory for current user".into()))?;
        Ok(Self {
            root: dirs.cache_dir().join("rootfs"),
        })
    }

    /// Cache rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an archive to its extracted directory, extracting on miss.
    ///
    /// With an explicit `target`, the archive is extracted there instead of
    /// the content-addressed location; the marker and lock discipline still
    /// apply. Concurrent callers (including other processes) serialize on an
    /// advisory lock held on a sibling lockfile, so the extraction runs at
    /// most once per entry.
    pub async fn resolve(
        &self,
        archive: &Path,
        target: Option<&Path>,
    ) -> Result<PathBuf, RootfsError> {
        if !archive.is_file() {
            return Err(RootfsError::ArchiveNotFound(archive.to_path_buf()));
        }

        let entry = match target {
            Some(dir) => dir.to_path_buf(),
            None => {
                let to_hash = archive.to_path_buf();
                let digest =
                    tokio::task::spawn_blocking(move || digest::file_digest(&to_hash)).await??;
                self.root.join(digest)
            }
        };
        if let Some(parent) = entry.parent() {
            fs::create_dir_all(parent)?;
        }

        let guard = LockGuard::acquire(&lock_path_for(&entry), LOCK_TIMEOUT).await?;
        let dir = entry.clone();
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || extract_locked(&archive, &dir)).await??;
        drop(guard);

        Ok(entry)
    }

    /// Remove every cached extraction. Missing root is not an error.
    pub fn clear(&self) -> Result<(), RootfsError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Sibling lockfile for an entry directory (`<entry>.lock`).
fn lock_path_for(entry: &Path) -> PathBuf {
    let mut name = entry
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    entry.with_file_name(name)
}

/// Body of `resolve` that runs while the entry lock is held.
fn extract_locked(archive: &Path, dir: &Path) -> Result<(), RootfsError> {
    let marker = dir.join(COMPLETION_MARKER);
    if marker.exists() {
        debug!("rootfs cache hit at {}", dir.display());
        return Ok(());
    }
    if dir.exists() {
        // No marker means a partial extraction left over from a crash.
        warn!("discarding partial extraction at {}", dir.display());
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    if let Err(err) = extract::unpack_archive(archive, dir) {
        let _ = fs::remove_dir_all(dir);
        return Err(err);
    }
    // Marker lands atomically so a crash mid-write can't certify the entry.
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.persist(&marker)
        .map_err(|err| RootfsError::Io(err.error))?;
    info!("extracted {} into {}", archive.display(), dir.display());
    Ok(())
}

/// Advisory file lock released on drop.
#[must_use]
struct LockGuard {
    file: fs::File,
    path: PathBuf,
}

impl LockGuard {
    async fn acquire(path: &Path, timeout: Duration) -> Result<Self, RootfsError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        // Uncontended fast path.
        let (quick, file) = tokio::task::spawn_blocking(move || (file.try_lock(), file)).await?;
        match quick {
            Ok(()) => {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(fs::TryLockError::WouldBlock) => {}
            Err(fs::TryLockError::Error(err)) => return Err(err.into()),
        }

        info!("waiting for extraction lock at {}", path.display());
        let blocking = tokio::task::spawn_blocking(move || (file.lock(), file));
        let (result, file) = tokio::time::timeout(timeout, blocking)
            .await
            .map_err(|_| RootfsError::LockTimeout {
                path: path.to_path_buf(),
                timeout,
            })??;
        result?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(
                "failed to release extraction lock at {}: {err}",
                self.path.display()
            );
        }
    }
}
