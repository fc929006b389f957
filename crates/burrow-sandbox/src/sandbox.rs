//! Sandbox coordinator: scoped acquisition with guaranteed release.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use burrow_rootfs::RootfsCache;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use uuid::Uuid;

use crate::config::{NetworkMode, PortForward, SandboxConfig};
use crate::error::SandboxError;
use crate::network::NetworkHandle;
use crate::overlay::Overlay;
use crate::process::{ExitStatus, ProcessState, SandboxedProcess};
use crate::runner::{IoMode, Launcher, NetworkPlan};
use crate::workspace::SessionWorkspace;

/// Grace between SIGTERM and SIGKILL when close terminates live children.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Constructed,
    Open,
    Closing,
    Closed,
}

/// Per-run options for [`Sandbox::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stdio wiring; pipes with all three streams by default.
    pub io: IoMode,
    /// Extra environment variables for this command only.
    pub env: BTreeMap<String, String>,
    /// Default wait deadline for this process; falls back to the sandbox's
    /// configured default when unset.
    pub timeout: Option<Duration>,
    /// Join an existing network namespace by PID instead of the configured
    /// policy's namespace.
    pub join_netns_pid: Option<u32>,
}

/// Options for [`Sandbox::run_script`].
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Interpreter invoked with the script path.
    pub run_command: String,
    /// Extension given to the serialized script file.
    pub extension: String,
    /// Options passed through to the underlying run.
    pub run: RunOptions,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            run_command: "python".to_string(),
            extension: "py".to_string(),
            run: RunOptions::default(),
        }
    }
}

/// One sandbox session: cached rootfs + writable workspace + optional
/// overlay and network, with ordered teardown on every exit path.
///
/// Construction only captures and validates configuration. [`open`]
/// provisions everything and transitions to `Open`; any failure there rolls
/// back completed steps in reverse order. [`close`] is idempotent and runs
/// every teardown step even when one of them fails, returning the first
/// failure afterwards. Dropping an open sandbox performs a synchronous
/// best-effort teardown.
///
/// [`open`]: Sandbox::open
/// [`close`]: Sandbox::close
#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    cache: RootfsCache,
    state: SandboxState,
    workspace: Option<SessionWorkspace>,
    overlay: Option<Overlay>,
    network: Option<NetworkHandle>,
    launcher: Option<Launcher>,
    processes: Vec<Arc<ProcessState>>,
}

impl Sandbox {
    /// Validate the configuration against the per-user rootfs cache.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let cache = RootfsCache::new()?;
        Self::with_cache(config, cache)
    }

    /// Validate the configuration against an explicit cache.
    pub fn with_cache(config: SandboxConfig, cache: RootfsCache) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            config,
            cache,
            state: SandboxState::Constructed,
            workspace: None,
            overlay: None,
            network: None,
            launcher: None,
            processes: Vec::new(),
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host path of the session directory while the sandbox is open.
    pub fn work_dir(&self) -> Option<&Path> {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.session_path())
    }

    /// Host path of the overlay mount point while an overlay is active.
    pub fn overlay_mount(&self) -> Option<&Path> {
        self.overlay.as_ref().map(|overlay| overlay.mount_point())
    }

    /// Resolve the rootfs, allocate the workspace, mount the overlay, and
    /// configure networking. On failure, everything set up so far is torn
    /// down again and the sandbox lands in `Closed`.
    pub async fn open(&mut self) -> Result<(), SandboxError> {
        if self.state != SandboxState::Constructed {
            return Err(SandboxError::InvalidConfig(
                "sandbox can only be opened once".to_string(),
            ));
        }
        match self.open_inner().await {
            Ok(()) => {
                self.state = SandboxState::Open;
                info!("sandbox open (session at {:?})", self.work_dir());
                Ok(())
            }
            Err(err) => {
                warn!("sandbox setup failed, rolling back: {err}");
                self.rollback().await;
                self.state = SandboxState::Closed;
                Err(err)
            }
        }
    }

    async fn open_inner(&mut self) -> Result<(), SandboxError> {
        let bwrap = which::which("bwrap").map_err(|_| {
            SandboxError::DependencyMissing("bubblewrap (bwrap) not found in PATH".to_string())
        })?;

        let rootfs_dir = self
            .cache
            .resolve(&self.config.rootfs, self.config.rootfs_dir.as_deref())
            .await?;
        debug!("rootfs resolved to {}", rootfs_dir.display());

        self.workspace = Some(SessionWorkspace::allocate(&self.config)?);

        if self.config.overlay {
            let Some(workspace) = &self.workspace else {
                return Err(SandboxError::Setup("workspace missing".to_string()));
            };
            let Some(dirs) = workspace.overlay() else {
                return Err(SandboxError::Setup(
                    "overlay directories were not allocated".to_string(),
                ));
            };
            let overlay = Overlay::mount(
                &rootfs_dir,
                dirs.upper(),
                dirs.work(),
                dirs.mount(),
                self.config.persist_overlay,
            )
            .await?;
            self.overlay = Some(overlay);
        }

        if let NetworkMode::Outbound { host_loopback } = self.config.network {
            let network =
                NetworkHandle::provision(host_loopback, &self.config.port_forwards).await?;
            self.network = Some(network);
        }

        let root_dir = match &self.overlay {
            Some(overlay) => overlay.mount_point().to_path_buf(),
            None => rootfs_dir,
        };
        let network_plan = match (&self.config.network, &self.network) {
            (NetworkMode::Host, _) => NetworkPlan::Host,
            (NetworkMode::Isolated, _) => NetworkPlan::Isolated,
            (NetworkMode::Outbound { .. }, Some(network)) => NetworkPlan::Join {
                ns_pid: network.namespace_pid(),
                hosts_file: network.hosts_file().to_path_buf(),
                resolv_file: network.resolv_file().to_path_buf(),
            },
            (NetworkMode::Outbound { .. }, None) => {
                return Err(SandboxError::Setup("network handle missing".to_string()));
            }
        };

        let Some(workspace) = &self.workspace else {
            return Err(SandboxError::Setup("workspace missing".to_string()));
        };
        self.launcher = Some(Launcher {
            bwrap,
            nsenter: None,
            root_dir,
            root_writable: self.overlay.is_some(),
            session_dir: workspace.session_path().to_path_buf(),
            tmp_dir: workspace.tmp_path().to_path_buf(),
            home: self.config.home_dir(),
            user: self.config.user.clone(),
            base_env: self.config.env.clone(),
            network: network_plan,
        });
        Ok(())
    }

    /// Reverse-order teardown of partial setup; errors are logged only.
    async fn rollback(&mut self) {
        if let Some(mut network) = self.network.take() {
            if let Err(err) = network.close().await {
                warn!("rollback: network teardown failed: {err}");
            }
        }
        if let Some(mut overlay) = self.overlay.take() {
            if let Err(err) = overlay.unmount().await {
                warn!("rollback: overlay unmount failed: {err}");
            }
        }
        if let Some(mut workspace) = self.workspace.take() {
            if let Err(err) = workspace.release() {
                warn!("rollback: workspace release failed: {err}");
            }
        }
        self.launcher = None;
    }

    /// Run a shell command inside the sandbox, returning its supervisor.
    ///
    /// The command string is interpreted by `/bin/sh -c` inside the
    /// namespaces. The coordinator retains a reference so close can
    /// terminate the process if the caller never does.
    pub async fn run(
        &mut self,
        command: &str,
        options: RunOptions,
    ) -> Result<SandboxedProcess, SandboxError> {
        if self.state != SandboxState::Open {
            return Err(SandboxError::NotOpen);
        }
        if let Some(network) = &mut self.network {
            network.ensure_alive()?;
        }
        let Some(launcher) = &self.launcher else {
            return Err(SandboxError::NotOpen);
        };

        let spawned = launcher.spawn(command, options.io, &options.env, options.join_netns_pid)?;
        let timeout = options.timeout.or(self.config.default_timeout);
        let process = SandboxedProcess::new(spawned, timeout)?;
        self.processes.push(process.state());
        debug!("spawned sandboxed command (pid {})", process.pid());
        Ok(process)
    }

    /// Serialize `code` into the session directory and run it with the
    /// configured interpreter, e.g. `python /home/sandbox/script_<id>.py`.
    pub async fn run_script(
        &mut self,
        code: &str,
        options: ScriptOptions,
    ) -> Result<SandboxedProcess, SandboxError> {
        if self.state != SandboxState::Open {
            return Err(SandboxError::NotOpen);
        }
        let name = format!("script_{}.{}", Uuid::new_v4().simple(), options.extension);
        let host_path = {
            let Some(workspace) = &self.workspace else {
                return Err(SandboxError::NotOpen);
            };
            workspace.session_path().join(&name)
        };
        tokio::fs::write(&host_path, code).await?;

        let command = format!("{} {}/{}", options.run_command, self.config.home_dir(), name);
        self.run(&command, options.run).await
    }

    /// Relay a port-forward request to the running network helper.
    pub async fn forward_port(&mut self, forward: PortForward) -> Result<(), SandboxError> {
        if self.state != SandboxState::Open {
            return Err(SandboxError::NotOpen);
        }
        let Some(network) = &mut self.network else {
            return Err(SandboxError::InvalidConfig(
                "port forwarding requires outbound networking".to_string(),
            ));
        };
        network.forward_port(&forward).await
    }

    /// Tear everything down in reverse setup order: live children, network
    /// helpers, overlay (unless persisted), engine-allocated directories.
    ///
    /// Every step runs even when an earlier one fails; the first failure is
    /// returned. A second close is a no-op.
    pub async fn close(&mut self) -> Result<(), SandboxError> {
        match self.state {
            SandboxState::Closed => return Ok(()),
            SandboxState::Constructed => {
                self.state = SandboxState::Closed;
                return Ok(());
            }
            _ => {}
        }
        self.state = SandboxState::Closing;
        info!("closing sandbox");
        let mut first_err: Option<SandboxError> = None;

        let live: Vec<_> = self
            .processes
            .drain(..)
            .filter(|state| state.terminal().is_none())
            .collect();
        if !live.is_empty() {
            debug!("terminating {} live process group(s)", live.len());
            for state in &live {
                let _ = signal::killpg(Pid::from_raw(state.pid() as i32), Signal::SIGTERM);
            }
            tokio::time::sleep(CLOSE_GRACE).await;
            for state in &live {
                if state.terminal().is_none() {
                    let _ = signal::killpg(Pid::from_raw(state.pid() as i32), Signal::SIGKILL);
                    state.set(ExitStatus::Cancelled);
                }
            }
        }

        if let Some(mut network) = self.network.take() {
            if let Err(err) = network.close().await {
                warn!("network teardown failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        if let Some(mut overlay) = self.overlay.take() {
            if let Err(err) = overlay.unmount().await {
                warn!("overlay unmount failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        if let Some(mut workspace) = self.workspace.take() {
            if let Err(err) = workspace.release() {
                warn!("workspace release failed: {err}");
                first_err.get_or_insert(err);
            }
        }

        self.launcher = None;
        self.state = SandboxState::Closed;
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if matches!(self.state, SandboxState::Open | SandboxState::Closing) {
            warn!("sandbox dropped while open; running synchronous teardown");
            for state in self.processes.drain(..) {
                if state.terminal().is_none() {
                    let _ = signal::killpg(Pid::from_raw(state.pid() as i32), Signal::SIGKILL);
                }
            }
            // NetworkHandle and Overlay clean up after themselves on drop.
            self.network.take();
            self.overlay.take();
            if let Some(mut workspace) = self.workspace.take() {
                let _ = workspace.release();
            }
            self.state = SandboxState::Closed;
        }
    }
}
