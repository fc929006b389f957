//! Assembly and launch of the unprivileged sandbox helper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::debug;
use tokio::process::{Child, Command};

use crate::error::SandboxError;
use crate::pty::PtyMaster;

/// PATH exposed inside the sandbox.
const SANDBOX_PATH: &str = "/usr/bin:/bin:/usr/local/bin:/sbin";

/// Host variables passed through to the sandbox when set.
const PASSTHROUGH_VARS: &[&str] = &["TERM", "LANG", "LC_ALL"];

/// How a sandboxed child's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Independent pipes; each stream individually optional.
    Pipe {
        stdin: bool,
        stdout: bool,
        stderr: bool,
    },
    /// A single pseudoterminal carrying stdin and the merged output.
    Pty,
}

impl IoMode {
    /// Pipe mode with all three streams requested.
    pub fn pipes() -> Self {
        IoMode::Pipe {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

impl Default for IoMode {
    fn default() -> Self {
        Self::pipes()
    }
}

/// Network shape the runner bakes into the helper invocation.
#[derive(Debug, Clone)]
pub(crate) enum NetworkPlan {
    /// Share the host's namespace; host resolver config is visible.
    Host,
    /// Fresh, empty namespace.
    Isolated,
    /// Enter a provisioned namespace by PID before launching the helper.
    Join {
        ns_pid: u32,
        hosts_file: PathBuf,
        resolv_file: PathBuf,
    },
}

/// A launched helper child plus its PTY master, when one was opened.
pub(crate) struct Spawned {
    pub(crate) child: Child,
    pub(crate) pty: Option<PtyMaster>,
}

/// Everything needed to turn a command string into a bwrap invocation.
#[derive(Debug, Clone)]
pub(crate) struct Launcher {
    pub(crate) bwrap: PathBuf,
    pub(crate) nsenter: Option<PathBuf>,
    /// Rootfs directory, or the overlay mount point.
    pub(crate) root_dir: PathBuf,
    /// Whether `/` is bound writable (overlay active).
    pub(crate) root_writable: bool,
    pub(crate) session_dir: PathBuf,
    pub(crate) tmp_dir: PathBuf,
    pub(crate) home: String,
    pub(crate) user: String,
    pub(crate) base_env: BTreeMap<String, String>,
    pub(crate) network: NetworkPlan,
}

impl Launcher {
    /// Spawn `<shell> -c <command>` under the sandbox helper.
    pub(crate) fn spawn(
        &self,
        command: &str,
        io: IoMode,
        env: &BTreeMap<String, String>,
        join_netns_pid: Option<u32>,
    ) -> Result<Spawned, SandboxError> {
        let join = self.join_target(join_netns_pid)?;
        let argv = self.argv(command, io, env, join.as_ref().map(|(path, pid)| (path.as_path(), *pid)));
        debug!("spawning sandbox helper for command: {command}");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.kill_on_drop(true);

        match io {
            IoMode::Pipe {
                stdin,
                stdout,
                stderr,
            } => {
                cmd.stdin(if stdin { Stdio::piped() } else { Stdio::null() });
                cmd.stdout(if stdout { Stdio::piped() } else { Stdio::null() });
                cmd.stderr(if stderr { Stdio::piped() } else { Stdio::null() });
                // Own process group, so signals reach the helper and every
                // descendant its PID namespace would otherwise shelter.
                unsafe {
                    cmd.pre_exec(|| {
                        if libc::setpgid(0, 0) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                let child = cmd.spawn()?;
                Ok(Spawned { child, pty: None })
            }
            IoMode::Pty => {
                let (master, slave) = PtyMaster::open()?;
                cmd.stdin(Stdio::from(slave.try_clone()?));
                cmd.stdout(Stdio::from(slave.try_clone()?));
                cmd.stderr(Stdio::from(slave));
                unsafe {
                    cmd.pre_exec(|| {
                        // New session, with the slave (already dup'd onto
                        // fd 0) as the controlling terminal.
                        if libc::setsid() < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                let child = cmd.spawn()?;
                Ok(Spawned {
                    child,
                    pty: Some(master),
                })
            }
        }
    }

    fn join_target(
        &self,
        join_netns_pid: Option<u32>,
    ) -> Result<Option<(PathBuf, u32)>, SandboxError> {
        let pid = match (&self.network, join_netns_pid) {
            (NetworkPlan::Join { ns_pid, .. }, override_pid) => override_pid.unwrap_or(*ns_pid),
            (_, Some(pid)) => pid,
            (_, None) => return Ok(None),
        };
        let nsenter = match &self.nsenter {
            Some(path) => path.clone(),
            None => which::which("nsenter").map_err(|_| {
                SandboxError::DependencyMissing("nsenter not found in PATH".to_string())
            })?,
        };
        Ok(Some((nsenter, pid)))
    }

    /// Full argv, program first. Pure so tests can inspect it.
    pub(crate) fn argv(
        &self,
        command: &str,
        io: IoMode,
        env: &BTreeMap<String, String>,
        join: Option<(&Path, u32)>,
    ) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();

        if let Some((nsenter, pid)) = join {
            argv.push(nsenter.display().to_string());
            argv.push(format!("--user=/proc/{pid}/ns/user"));
            argv.push(format!("--net=/proc/{pid}/ns/net"));
            argv.push("--preserve-credentials".to_string());
            argv.push("--".to_string());
        }

        argv.push(self.bwrap.display().to_string());
        argv.extend(
            [
                "--die-with-parent",
                "--unshare-user",
                "--uid",
                "1000",
                "--gid",
                "1000",
                "--unshare-pid",
                "--unshare-uts",
                "--unshare-ipc",
            ]
            .map(str::to_string),
        );

        let share_net = join.is_some() || matches!(self.network, NetworkPlan::Host);
        argv.push(if share_net { "--share-net" } else { "--unshare-net" }.to_string());
        argv.push("--hostname".to_string());
        argv.push("sandbox".to_string());

        let root_flag = if self.root_writable {
            "--bind"
        } else {
            "--ro-bind"
        };
        push_bind(&mut argv, root_flag, &self.root_dir, "/");
        // /dev and /proc land after the rootfs bind so they are not shadowed.
        argv.extend(["--dev", "/dev", "--proc", "/proc"].map(str::to_string));
        push_bind(&mut argv, "--bind", &self.session_dir, &self.home);
        push_bind(&mut argv, "--bind", &self.tmp_dir, "/tmp");

        match &self.network {
            NetworkPlan::Host => {
                let resolv = Path::new("/etc/resolv.conf");
                if resolv.exists() {
                    push_bind(&mut argv, "--ro-bind", resolv, "/etc/resolv.conf");
                }
            }
            NetworkPlan::Isolated => {}
            NetworkPlan::Join {
                hosts_file,
                resolv_file,
                ..
            } => {
                push_bind(&mut argv, "--ro-bind", hosts_file, "/etc/hosts");
                push_bind(&mut argv, "--ro-bind", resolv_file, "/etc/resolv.conf");
                argv.push("--cap-add".to_string());
                argv.push("CAP_NET_RAW".to_string());
            }
        }

        argv.push("--chdir".to_string());
        argv.push(self.home.clone());

        argv.push("--clearenv".to_string());
        for (key, value) in self.build_env(env) {
            argv.push("--setenv".to_string());
            argv.push(key);
            argv.push(value);
        }

        if matches!(io, IoMode::Pipe { .. }) {
            // Detach from the caller's terminal; PTY mode manages its own
            // session in pre_exec instead.
            argv.push("--new-session".to_string());
        }

        argv.push("--".to_string());
        argv.extend(["/bin/sh", "-c"].map(str::to_string));
        argv.push(command.to_string());
        argv
    }

    /// Curated sandbox environment; unspecified host variables are dropped.
    fn build_env(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), self.home.clone());
        env.insert("USER".to_string(), self.user.clone());
        env.insert("LOGNAME".to_string(), self.user.clone());
        env.insert("PWD".to_string(), self.home.clone());
        env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
        for key in PASSTHROUGH_VARS {
            if let Ok(value) = std::env::var(key) {
                env.insert((*key).to_string(), value);
            }
        }
        for (key, value) in &self.base_env {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

fn push_bind(argv: &mut Vec<String>, flag: &str, source: &Path, target: impl AsRef<str>) {
    argv.push(flag.to_string());
    argv.push(source.display().to_string());
    argv.push(target.as_ref().to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn launcher(network: NetworkPlan, root_writable: bool) -> Launcher {
        Launcher {
            bwrap: PathBuf::from("/usr/bin/bwrap"),
            nsenter: Some(PathBuf::from("/usr/bin/nsenter")),
            root_dir: PathBuf::from("/cache/rootfs/abc"),
            root_writable,
            session_dir: PathBuf::from("/tmp/burrow-session-x"),
            tmp_dir: PathBuf::from("/tmp/burrow-tmp-x"),
            home: "/home/sandbox".to_string(),
            user: "sandbox".to_string(),
            base_env: BTreeMap::new(),
            network,
        }
    }

    fn window(argv: &[String], wanted: &[&str]) -> bool {
        argv.windows(wanted.len())
            .any(|w| w.iter().map(String::as_str).eq(wanted.iter().copied()))
    }

    #[test]
    fn binds_rootfs_session_and_tmp() {
        let argv = launcher(NetworkPlan::Isolated, false).argv(
            "echo hi",
            IoMode::pipes(),
            &BTreeMap::new(),
            None,
        );
        assert_eq!(argv[0], "/usr/bin/bwrap");
        assert!(window(&argv, &["--ro-bind", "/cache/rootfs/abc", "/"]));
        assert!(window(
            &argv,
            &["--bind", "/tmp/burrow-session-x", "/home/sandbox"]
        ));
        assert!(window(&argv, &["--bind", "/tmp/burrow-tmp-x", "/tmp"]));
        assert!(window(&argv, &["--chdir", "/home/sandbox"]));
        assert!(window(&argv, &["--hostname", "sandbox"]));
        assert!(window(&argv, &["--", "/bin/sh", "-c", "echo hi"]));
    }

    #[test]
    fn overlay_root_is_bound_writable() {
        let argv = launcher(NetworkPlan::Isolated, true).argv(
            "true",
            IoMode::pipes(),
            &BTreeMap::new(),
            None,
        );
        assert!(window(&argv, &["--bind", "/cache/rootfs/abc", "/"]));
    }

    #[test]
    fn isolated_unshares_and_host_shares_the_network() {
        let isolated = launcher(NetworkPlan::Isolated, false).argv(
            "true",
            IoMode::pipes(),
            &BTreeMap::new(),
            None,
        );
        assert!(isolated.contains(&"--unshare-net".to_string()));

        let host =
            launcher(NetworkPlan::Host, false).argv("true", IoMode::pipes(), &BTreeMap::new(), None);
        assert!(host.contains(&"--share-net".to_string()));
    }

    #[test]
    fn joined_namespace_enters_via_nsenter() {
        let plan = NetworkPlan::Join {
            ns_pid: 4242,
            hosts_file: PathBuf::from("/tmp/net/hosts"),
            resolv_file: PathBuf::from("/tmp/net/resolv.conf"),
        };
        let argv = launcher(plan, false).argv(
            "true",
            IoMode::pipes(),
            &BTreeMap::new(),
            Some((Path::new("/usr/bin/nsenter"), 4242)),
        );
        assert_eq!(argv[0], "/usr/bin/nsenter");
        assert_eq!(argv[1], "--user=/proc/4242/ns/user");
        assert_eq!(argv[2], "--net=/proc/4242/ns/net");
        assert!(argv.contains(&"--share-net".to_string()));
        assert!(window(&argv, &["--ro-bind", "/tmp/net/hosts", "/etc/hosts"]));
        assert!(window(
            &argv,
            &["--ro-bind", "/tmp/net/resolv.conf", "/etc/resolv.conf"]
        ));
    }

    #[test]
    fn environment_is_curated_and_overridable() {
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var("BURROW_TEST_SECRET", "leak me not") };
        let mut overrides = BTreeMap::new();
        overrides.insert("EXTRA".to_string(), "1".to_string());

        let argv =
            launcher(NetworkPlan::Isolated, false).argv("env", IoMode::pipes(), &overrides, None);

        assert!(window(&argv, &["--setenv", "HOME", "/home/sandbox"]));
        assert!(window(&argv, &["--setenv", "USER", "sandbox"]));
        assert!(window(&argv, &["--setenv", "PWD", "/home/sandbox"]));
        assert!(window(&argv, &["--setenv", "EXTRA", "1"]));
        assert!(!argv.contains(&"BURROW_TEST_SECRET".to_string()));
        assert!(argv.contains(&"--clearenv".to_string()));
    }

    #[test]
    fn new_session_only_in_pipe_mode() {
        let base = launcher(NetworkPlan::Isolated, false);
        let pipes = base.argv("true", IoMode::pipes(), &BTreeMap::new(), None);
        assert!(pipes.contains(&"--new-session".to_string()));

        let pty = base.argv("true", IoMode::Pty, &BTreeMap::new(), None);
        assert!(!pty.contains(&"--new-session".to_string()));
    }
}
