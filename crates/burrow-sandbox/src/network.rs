//! Isolated network namespaces with userspace outbound transport.
//!
//! Outbound mode keeps a tiny anchor process alive inside a fresh
//! user+network namespace and points slirp4netns at it. Sandboxed commands
//! then join that namespace via nsenter, so every process of one session
//! shares the same tap device and forwarded ports.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::config::PortForward;
use crate::error::SandboxError;

const NAMESPACE_TIMEOUT: Duration = Duration::from_millis(500);
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
const HELPER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Address slirp4netns assigns to the guest tap device.
const GUEST_ADDR: &str = "10.0.2.100";
/// slirp4netns's built-in DNS forwarder.
const SLIRP_DNS: &str = "10.0.2.3";

/// Reply frame from the slirp4netns control socket.
#[derive(Debug, Deserialize)]
struct ApiReply {
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// A provisioned outbound network: anchor namespace + slirp4netns.
///
/// Helper liveness parallels sandbox liveness; a helper that dies early
/// makes subsequent network-dependent operations fail loudly.
#[derive(Debug)]
pub(crate) struct NetworkHandle {
    anchor: Child,
    anchor_pid: u32,
    slirp: Child,
    slirp_pid: u32,
    scratch: PathBuf,
    hosts_file: PathBuf,
    resolv_file: PathBuf,
    api_socket: PathBuf,
    closed: bool,
}

impl NetworkHandle {
    /// Spawn and ready the helpers, then apply the initial port forwards.
    pub(crate) async fn provision(
        host_loopback: bool,
        forwards: &[PortForward],
    ) -> Result<Self, SandboxError> {
        let unshare = find("unshare")?;
        let nsenter = find("nsenter")?;
        let slirp_bin = find("slirp4netns")?;

        let scratch = tempfile::Builder::new()
            .prefix("burrow-net-")
            .tempdir()?
            .keep();
        match Self::provision_inner(&unshare, &nsenter, &slirp_bin, &scratch, host_loopback).await
        {
            Ok(mut handle) => {
                for forward in forwards {
                    handle.forward_port(forward).await?;
                }
                Ok(handle)
            }
            Err(err) => {
                // Children carry kill_on_drop, so dropping the partial state
                // reaps them; only the scratch dir needs explicit removal.
                let _ = std::fs::remove_dir_all(&scratch);
                Err(err)
            }
        }
    }

    async fn provision_inner(
        unshare: &Path,
        nsenter: &Path,
        slirp_bin: &Path,
        scratch: &Path,
        host_loopback: bool,
    ) -> Result<Self, SandboxError> {
        let mut anchor = Command::new(unshare)
            .args([
                "--user",
                "--map-root-user",
                "--net",
                "--keep-caps",
                "sh",
                "-c",
                "sleep infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let anchor_pid = anchor
            .id()
            .ok_or_else(|| SandboxError::Setup("namespace anchor exited at spawn".to_string()))?;

        wait_for_namespace(nsenter, &mut anchor, anchor_pid).await?;
        bring_loopback_up(nsenter, anchor_pid).await?;

        let hosts_file = scratch.join("hosts");
        std::fs::write(
            &hosts_file,
            "127.0.0.1 localhost\n::1 localhost\n127.0.1.1 sandbox\n",
        )?;
        let resolv_file = scratch.join("resolv.conf");
        std::fs::write(
            &resolv_file,
            format!("nameserver {SLIRP_DNS}\nnameserver 8.8.8.8\nnameserver 8.8.4.4\n"),
        )?;

        let api_socket = scratch.join("slirp.sock");
        let mut command = Command::new(slirp_bin);
        command.arg("--api-socket").arg(&api_socket);
        if !host_loopback {
            command.arg("--disable-host-loopback");
        }
        let mut slirp = command
            .arg("--configure")
            .arg(anchor_pid.to_string())
            .arg("tap0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let slirp_pid = slirp
            .id()
            .ok_or_else(|| SandboxError::Setup("slirp4netns exited at spawn".to_string()))?;

        wait_for_api_socket(&mut slirp, &api_socket).await?;
        info!("outbound network ready (netns pid {anchor_pid}, slirp pid {slirp_pid})");

        Ok(Self {
            anchor,
            anchor_pid,
            slirp,
            slirp_pid,
            scratch: scratch.to_path_buf(),
            hosts_file,
            resolv_file,
            api_socket,
            closed: false,
        })
    }

    /// PID whose namespaces sandboxed commands join.
    pub(crate) fn namespace_pid(&self) -> u32 {
        self.anchor_pid
    }

    pub(crate) fn hosts_file(&self) -> &Path {
        &self.hosts_file
    }

    pub(crate) fn resolv_file(&self) -> &Path {
        &self.resolv_file
    }

    /// Fail if either helper is gone.
    pub(crate) fn ensure_alive(&mut self) -> Result<(), SandboxError> {
        for (child, name) in [
            (&mut self.anchor, "namespace anchor"),
            (&mut self.slirp, "slirp4netns"),
        ] {
            if child.try_wait()?.is_some() {
                return Err(SandboxError::HelperDied(format!(
                    "{name} exited before the sandbox closed"
                )));
            }
        }
        Ok(())
    }

    /// Relay a port-forward request over the helper's control socket.
    pub(crate) async fn forward_port(
        &mut self,
        forward: &PortForward,
    ) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let request = json!({
            "execute": "add_hostfwd",
            "arguments": {
                "proto": forward.proto.as_str(),
                "host_addr": "127.0.0.1",
                "host_port": forward.host_port,
                "guest_addr": GUEST_ADDR,
                "guest_port": forward.sandbox_port,
            },
        });
        debug!(
            "forwarding {}:{} -> sandbox:{}",
            forward.proto.as_str(),
            forward.host_port,
            forward.sandbox_port
        );

        let mut stream = UnixStream::connect(&self.api_socket).await?;
        let mut payload = request.to_string();
        payload.push('\n');
        stream.write_all(payload.as_bytes()).await?;
        stream.shutdown().await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let reply: ApiReply = serde_json::from_slice(&raw).map_err(|err| {
            SandboxError::Setup(format!("invalid reply from network helper: {err}"))
        })?;
        if let Some(error) = reply.error {
            return Err(SandboxError::Setup(format!(
                "port forward rejected by network helper: {error}"
            )));
        }
        Ok(())
    }

    /// Signal the helpers to exit, escalating to SIGKILL on timeout.
    pub(crate) async fn close(&mut self) -> Result<(), SandboxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_err = None;
        // slirp goes first so the tap quiesces before its namespace vanishes.
        let slirp_pid = self.slirp_pid;
        let anchor_pid = self.anchor_pid;
        for (child, pid, name) in [
            (&mut self.slirp, slirp_pid, "slirp4netns"),
            (&mut self.anchor, anchor_pid, "namespace anchor"),
        ] {
            if let Err(err) = terminate(child, pid, name).await {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = std::fs::remove_dir_all(&self.scratch) {
            if err.kind() != std::io::ErrorKind::NotFound {
                first_err.get_or_insert(SandboxError::Teardown(format!(
                    "could not remove {}: {err}",
                    self.scratch.display()
                )));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        if !self.closed {
            // Helpers are reaped by kill_on_drop; the scratch dir would leak.
            for pid in [self.slirp_pid, self.anchor_pid] {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            let _ = std::fs::remove_dir_all(&self.scratch);
        }
    }
}

async fn terminate(child: &mut Child, pid: u32, name: &str) -> Result<(), SandboxError> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    match tokio::time::timeout(HELPER_EXIT_TIMEOUT, child.wait()).await {
        Ok(status) => {
            status?;
            Ok(())
        }
        Err(_) => {
            warn!("{name} ignored SIGTERM; force-killing");
            child.kill().await?;
            Ok(())
        }
    }
}

fn find(name: &str) -> Result<PathBuf, SandboxError> {
    which::which(name)
        .map_err(|_| SandboxError::DependencyMissing(format!("{name} not found in PATH")))
}

async fn wait_for_namespace(
    nsenter: &Path,
    anchor: &mut Child,
    pid: u32,
) -> Result<(), SandboxError> {
    let user_ns = format!("/proc/{pid}/ns/user");
    let net_ns = format!("/proc/{pid}/ns/net");
    let deadline = tokio::time::Instant::now() + NAMESPACE_TIMEOUT;
    let mut last_error = "namespace paths not present yet".to_string();

    loop {
        if anchor.try_wait()?.is_some() {
            return Err(SandboxError::HelperDied(
                "namespace anchor exited before becoming ready".to_string(),
            ));
        }
        if Path::new(&user_ns).exists() && Path::new(&net_ns).exists() {
            let probe = Command::new(nsenter)
                .arg(format!("--user={user_ns}"))
                .arg(format!("--net={net_ns}"))
                .arg("--preserve-credentials")
                .arg("--")
                .arg("true")
                .stdout(Stdio::null())
                .output()
                .await?;
            if probe.status.success() {
                return Ok(());
            }
            last_error = String::from_utf8_lossy(&probe.stderr).trim().to_string();
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::Setup(format!(
                "network namespace for pid {pid} not ready within {NAMESPACE_TIMEOUT:?}: {last_error}"
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

async fn bring_loopback_up(nsenter: &Path, pid: u32) -> Result<(), SandboxError> {
    let output = Command::new(nsenter)
        .arg(format!("--user=/proc/{pid}/ns/user"))
        .arg(format!("--net=/proc/{pid}/ns/net"))
        .arg("--preserve-credentials")
        .args(["--", "ip", "link", "set", "lo", "up"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(SandboxError::Setup(format!(
            "failed to bring loopback up in namespace: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn wait_for_api_socket(slirp: &mut Child, socket: &Path) -> Result<(), SandboxError> {
    let deadline = tokio::time::Instant::now() + API_SOCKET_TIMEOUT;
    let mut last_error = "control socket not ready yet".to_string();

    loop {
        if slirp.try_wait()?.is_some() {
            return Err(SandboxError::HelperDied(
                "slirp4netns exited before its control socket became ready".to_string(),
            ));
        }
        match UnixStream::connect(socket).await {
            Ok(_) => return Ok(()),
            Err(err) => last_error = err.to_string(),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::Setup(format!(
                "timed out waiting for network helper control socket: {last_error}"
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
