//! Sandbox configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SandboxError;

/// Network policy for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Share the host's network namespace.
    Host,
    /// New, empty network namespace.
    #[default]
    Isolated,
    /// New namespace with userspace outbound transport (slirp4netns).
    Outbound {
        /// Whether the host's loopback is reachable from the sandbox.
        host_loopback: bool,
    },
}

impl NetworkMode {
    /// Whether this mode runs the userspace networking helper.
    pub fn is_outbound(&self) -> bool {
        matches!(self, NetworkMode::Outbound { .. })
    }
}

/// Transport protocol for a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

/// A host-port to sandbox-port mapping relayed to the network helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    /// Port bound on the host's loopback.
    pub host_port: u16,
    /// Port inside the sandbox's namespace.
    pub sandbox_port: u16,
    /// Transport protocol.
    pub proto: Proto,
}

/// Configuration captured at sandbox construction.
///
/// Mutually exclusive options are rejected by [`SandboxConfig::validate`],
/// which runs when the coordinator is constructed. Availability of external
/// helper binaries is checked later, at open.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Path to the rootfs archive (tar, optionally compressed).
    pub rootfs: PathBuf,
    /// Explicit extraction directory, bypassing the content-addressed
    /// location. Required for `persist_overlay`.
    pub rootfs_dir: Option<PathBuf>,
    /// Caller-provided session directory, mapped to the sandbox home.
    /// When set, the directory survives close.
    pub work_dir: Option<PathBuf>,
    /// Layer a writable FUSE overlay over the read-only rootfs.
    pub overlay: bool,
    /// Directory holding the overlay's upper/work/mount trees. When unset,
    /// the engine allocates (and later deletes) one.
    pub overlay_dir: Option<PathBuf>,
    /// Leave the overlay mounted after close. Requires `overlay_dir`.
    pub persist_overlay: bool,
    /// Network policy.
    pub network: NetworkMode,
    /// Port forwards applied as soon as the network helper is ready.
    pub port_forwards: Vec<PortForward>,
    /// Default deadline for waits on spawned processes.
    pub default_timeout: Option<Duration>,
    /// User name inside the sandbox; decides the home directory.
    pub user: String,
    /// Extra environment variables set for every spawned command.
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    /// Configuration with defaults matching a plain, isolated sandbox.
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            rootfs_dir: None,
            work_dir: None,
            overlay: false,
            overlay_dir: None,
            persist_overlay: false,
            network: NetworkMode::default(),
            port_forwards: Vec::new(),
            default_timeout: Some(Duration::from_secs(10)),
            user: "sandbox".to_string(),
            env: BTreeMap::new(),
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn rootfs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rootfs_dir = Some(dir.into());
        self
    }

    pub fn overlay(mut self, enabled: bool) -> Self {
        self.overlay = enabled;
        self
    }

    pub fn overlay_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overlay_dir = Some(dir.into());
        self
    }

    pub fn persist_overlay(mut self, persist: bool) -> Self {
        self.persist_overlay = persist;
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.network = mode;
        self
    }

    pub fn forward_port(mut self, forward: PortForward) -> Self {
        self.port_forwards.push(forward);
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Reject mutually exclusive or incomplete option combinations.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.persist_overlay && !self.overlay {
            return Err(SandboxError::InvalidConfig(
                "persist_overlay requires overlay".to_string(),
            ));
        }
        if self.persist_overlay && self.overlay_dir.is_none() {
            return Err(SandboxError::InvalidConfig(
                "persist_overlay requires an explicit overlay_dir".to_string(),
            ));
        }
        if self.overlay_dir.is_some() && !self.overlay {
            return Err(SandboxError::InvalidConfig(
                "overlay_dir has no effect without overlay".to_string(),
            ));
        }
        if !self.port_forwards.is_empty() && !self.network.is_outbound() {
            return Err(SandboxError::InvalidConfig(
                "port forwarding requires outbound networking".to_string(),
            ));
        }
        Ok(())
    }

    /// Home directory inside the sandbox for the configured user.
    pub(crate) fn home_dir(&self) -> String {
        if self.user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.user)
        }
    }
}
