//! Writable directory allocation for a sandbox session.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// One directory role, remembering who allocated it.
#[derive(Debug)]
struct Role {
    path: PathBuf,
    engine_allocated: bool,
}

impl Role {
    fn caller(path: PathBuf) -> Result<Self, SandboxError> {
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            engine_allocated: false,
        })
    }

    fn engine(prefix: &str) -> Result<Self, SandboxError> {
        // Detach from TempDir so deletion happens in close order, not at
        // whatever point the value drops.
        let path = tempfile::Builder::new().prefix(prefix).tempdir()?.keep();
        Ok(Self {
            path,
            engine_allocated: true,
        })
    }

    fn release(&self) -> io::Result<()> {
        if !self.engine_allocated {
            return Ok(());
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Host directories backing the overlay.
#[derive(Debug)]
pub(crate) struct OverlayDirs {
    parent: Role,
    upper: PathBuf,
    work: PathBuf,
    mount: PathBuf,
}

impl OverlayDirs {
    pub(crate) fn upper(&self) -> &Path {
        &self.upper
    }

    pub(crate) fn work(&self) -> &Path {
        &self.work
    }

    pub(crate) fn mount(&self) -> &Path {
        &self.mount
    }
}

/// The writable directories of one sandbox session.
///
/// The session directory maps to the sandbox home, the tmp directory to the
/// sandbox's `/tmp`. Engine-allocated roles live under the host temp
/// directory with unique names and are deleted on release; caller-provided
/// roles are left alone.
#[derive(Debug)]
pub(crate) struct SessionWorkspace {
    session: Role,
    tmp: Role,
    overlay: Option<OverlayDirs>,
    released: bool,
}

impl SessionWorkspace {
    pub(crate) fn allocate(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let session = match &config.work_dir {
            Some(dir) => Role::caller(dir.clone())?,
            None => Role::engine("burrow-session-")?,
        };
        // The tmp backing is always per-session and always engine-owned, so
        // the sandbox's /tmp is emptied on close.
        let tmp = Role::engine("burrow-tmp-")?;

        let overlay = if config.overlay {
            let parent = match &config.overlay_dir {
                Some(dir) => Role::caller(dir.clone())?,
                None => Role::engine("burrow-overlay-")?,
            };
            let upper = parent.path.join("upper");
            let work = parent.path.join("work");
            let mount = parent.path.join("mount");
            for dir in [&upper, &work, &mount] {
                fs::create_dir_all(dir)?;
            }
            Some(OverlayDirs {
                parent,
                upper,
                work,
                mount,
            })
        } else {
            None
        };

        debug!(
            "workspace allocated (session={}, tmp={}, overlay={})",
            session.path.display(),
            tmp.path.display(),
            overlay.is_some()
        );
        Ok(Self {
            session,
            tmp,
            overlay,
            released: false,
        })
    }

    pub(crate) fn session_path(&self) -> &Path {
        &self.session.path
    }

    pub(crate) fn tmp_path(&self) -> &Path {
        &self.tmp.path
    }

    pub(crate) fn overlay(&self) -> Option<&OverlayDirs> {
        self.overlay.as_ref()
    }

    /// Delete engine-allocated directories. Already-gone directories are
    /// fine; the first real failure is surfaced after every role has been
    /// attempted. Idempotent.
    pub(crate) fn release(&mut self) -> Result<(), SandboxError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_err = None;
        let mut roles = vec![&self.session, &self.tmp];
        if let Some(overlay) = &self.overlay {
            roles.push(&overlay.parent);
        }
        for role in roles {
            if let Err(err) = role.release() {
                warn!("failed to release {}: {err}", role.path.display());
                first_err.get_or_insert(SandboxError::Teardown(format!(
                    "could not remove {}: {err}",
                    role.path.display()
                )));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
