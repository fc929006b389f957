//! Rootfs cache error types.

use std::path::PathBuf;
use std::time::Duration;

/// Errors returned by the rootfs cache.
#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The archive file does not exist or is unreadable.
    #[error("rootfs archive not found: {0}")]
    ArchiveNotFound(PathBuf),
    /// The archive is neither a known compressed stream nor a tar file.
    #[error("unrecognized archive format: {0}")]
    UnknownFormat(PathBuf),
    /// The archive contains an absolute or parent-relative entry path.
    #[error("unsafe path in archive: {0}")]
    UnsafeEntry(String),
    /// Another process held the extraction lock past the deadline.
    #[error("timed out after {timeout:?} waiting for extraction lock at {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },
    /// No per-user cache directory could be determined.
    #[error("cache root unavailable: {0}")]
    CacheRoot(String),
    /// A blocking worker task failed.
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}
