//! FUSE overlay mounting over the cached rootfs.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::SandboxError;

/// How long to wait for the FUSE helper's mount to appear.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const UNMOUNT_ATTEMPTS: u32 = 3;

/// fusermount3 ships with fuse3; plain fusermount is the legacy fallback.
const FUSERMOUNT_COMMANDS: &[&str] = &["fusermount3", "fusermount"];

/// A live FUSE overlay combining the read-only rootfs with a writable upper.
#[derive(Debug)]
pub(crate) struct Overlay {
    mount_point: PathBuf,
    mounted: bool,
    persist: bool,
}

impl Overlay {
    /// Mount `lower` + `upper` at `mount_point` via fuse-overlayfs and wait
    /// until the mount is observable.
    pub(crate) async fn mount(
        lower: &Path,
        upper: &Path,
        work: &Path,
        mount_point: &Path,
        persist: bool,
    ) -> Result<Self, SandboxError> {
        let helper = which::which("fuse-overlayfs").map_err(|_| {
            SandboxError::DependencyMissing("fuse-overlayfs not found in PATH".to_string())
        })?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        debug!("mounting overlay at {} ({options})", mount_point.display());

        // fuse-overlayfs daemonizes once the mount is set up, so a failed
        // invocation is visible in its exit status.
        let output = Command::new(helper)
            .arg("-o")
            .arg(&options)
            .arg(mount_point)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Setup(format!(
                "fuse-overlayfs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        wait_for_mount(mount_point, MOUNT_TIMEOUT).await?;
        info!("overlay mounted at {}", mount_point.display());
        Ok(Self {
            mount_point: mount_point.to_path_buf(),
            mounted: true,
            persist,
        })
    }

    pub(crate) fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount unless persistence was requested. Retries a few times before
    /// surfacing the failure; the caller still releases directories either
    /// way.
    pub(crate) async fn unmount(&mut self) -> Result<(), SandboxError> {
        if !self.mounted {
            return Ok(());
        }
        if self.persist {
            info!(
                "leaving overlay mounted at {} (persist)",
                self.mount_point.display()
            );
            self.mounted = false;
            return Ok(());
        }

        for attempt in 1..=UNMOUNT_ATTEMPTS {
            let mount_point = self.mount_point.clone();
            let done = tokio::task::spawn_blocking(move || unmount_once(&mount_point))
                .await
                .unwrap_or(false);
            if done {
                self.mounted = false;
                return Ok(());
            }
            warn!(
                "unmount attempt {attempt}/{UNMOUNT_ATTEMPTS} failed for {}",
                self.mount_point.display()
            );
            tokio::time::sleep(MOUNT_POLL_INTERVAL * attempt).await;
        }
        Err(SandboxError::Teardown(format!(
            "failed to unmount overlay at {}",
            self.mount_point.display()
        )))
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        if self.mounted && !self.persist {
            warn!(
                "overlay at {} dropped while mounted; unmounting",
                self.mount_point.display()
            );
            let _ = unmount_once(&self.mount_point);
        }
    }
}

/// One unmount pass over the known fusermount binaries. Returns whether the
/// path is no longer a mount point afterwards.
fn unmount_once(mount_point: &Path) -> bool {
    for command in FUSERMOUNT_COMMANDS {
        let status = std::process::Command::new(command)
            .arg("-u")
            .arg(mount_point)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if status.map(|status| status.success()).unwrap_or(false) {
            return true;
        }
    }
    !is_mountpoint(mount_point)
}

/// A path is a mount point when its device id differs from its parent's.
pub(crate) fn is_mountpoint(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("/"),
    };
    let Ok(parent_meta) = std::fs::metadata(parent) else {
        return false;
    };
    meta.dev() != parent_meta.dev()
}

async fn wait_for_mount(path: &Path, timeout: Duration) -> Result<(), SandboxError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_mountpoint(path) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::Setup(format!(
                "overlay mount at {} did not appear within {timeout:?}",
                path.display()
            )));
        }
        tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
    }
}
