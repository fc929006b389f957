//! Short-lived execution sandboxes on Linux, without a container daemon.
//!
//! Each sandbox pairs a cached, read-only rootfs (see `burrow-rootfs`) with
//! a writable session directory and runs commands inside kernel namespaces
//! via bubblewrap. Optional extras: a FUSE overlay for a mutable root view,
//! and userspace outbound networking via slirp4netns.
//!
//! ```ignore
//! use burrow_sandbox::{RunOptions, Sandbox, SandboxConfig};
//!
//! let mut sandbox = Sandbox::new(SandboxConfig::new("alpine.tar.zst"))?;
//! sandbox.open().await?;
//! let mut process = sandbox.run("echo hello", RunOptions::default()).await?;
//! let (stdout, _stderr) = process.communicate().await?;
//! assert_eq!(stdout, b"hello\n");
//! sandbox.close().await?;
//! ```

pub mod config;
pub mod error;
pub mod process;
pub mod sandbox;

mod network;
mod overlay;
mod pty;
mod runner;
mod workspace;

pub use config::{NetworkMode, PortForward, Proto, SandboxConfig};
pub use error::SandboxError;
pub use process::{
    ExitStatus, LineStream, OutputChunk, OutputLine, OutputStream, SandboxedProcess, StreamSource,
};
pub use runner::IoMode;
pub use sandbox::{RunOptions, Sandbox, SandboxState, ScriptOptions};
