//! Sandbox engine error types.

use std::time::Duration;

use crate::process::ExitStatus;

/// Errors returned by the sandbox engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Mutually exclusive or invalid configuration options.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A required external binary or kernel feature is missing.
    #[error("dependency missing: {0}")]
    DependencyMissing(String),
    /// Archive resolution or extraction failed.
    #[error(transparent)]
    Rootfs(#[from] burrow_rootfs::RootfsError),
    /// Namespace, mount, or helper setup failed.
    #[error("setup failed: {0}")]
    Setup(String),
    /// A helper process died while the sandbox still needed it.
    #[error("helper process exited unexpectedly: {0}")]
    HelperDied(String),
    /// Operation requires the sandbox to be open.
    #[error("sandbox is not open")]
    NotOpen,
    /// A checked wait observed a non-zero exit.
    #[error("command failed: {0:?}")]
    CommandFailed(ExitStatus),
    /// A wait or communicate exceeded its deadline.
    #[error("command execution exceeded {0:?}")]
    Timeout(Duration),
    /// The output stream was already consumed.
    #[error("output stream already taken")]
    StreamTaken,
    /// PTY-only operation on a pipe-mode process.
    #[error("process has no pseudoterminal")]
    NoPty,
    /// Teardown step failed; later steps still ran.
    #[error("teardown failed: {0}")]
    Teardown(String),
}
