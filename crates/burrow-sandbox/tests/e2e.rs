//! End-to-end sandbox tests.
//!
//! These exercise real bubblewrap sandboxes and need two things from the
//! host: `bwrap` on PATH and a rootfs archive (with `/bin/sh` and the usual
//! coreutils) named by `BURROW_TEST_ROOTFS`. Each test skips itself when
//! either is missing, so the suite stays green on bare CI hosts.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use burrow_rootfs::RootfsCache;
use burrow_sandbox::{
    ExitStatus, IoMode, RunOptions, Sandbox, SandboxConfig, SandboxError, SandboxState,
    ScriptOptions, StreamSource,
};
use pretty_assertions::assert_eq;

fn test_rootfs() -> Option<PathBuf> {
    if which::which("bwrap").is_err() {
        eprintln!("skipping: bwrap not installed");
        return None;
    }
    let Some(path) = std::env::var_os("BURROW_TEST_ROOTFS") else {
        eprintln!("skipping: BURROW_TEST_ROOTFS not set");
        return None;
    };
    Some(PathBuf::from(path))
}

fn shared_cache() -> RootfsCache {
    RootfsCache::at(std::env::temp_dir().join("burrow-e2e-cache"))
}

async fn open_sandbox(config: SandboxConfig) -> Sandbox {
    let mut sandbox = Sandbox::with_cache(config, shared_cache()).expect("construct");
    sandbox.open().await.expect("open");
    sandbox
}

#[tokio::test]
async fn echo_round_trip() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run("echo hello", RunOptions::default())
        .await
        .expect("run");
    let (stdout, stderr) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"hello\n");
    assert_eq!(stderr, b"");
    assert_eq!(process.status(), Some(ExitStatus::Exited(0)));

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn streams_are_tagged_by_source() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run("echo out; echo err 1>&2", RunOptions::default())
        .await
        .expect("run");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stream = process.stream().expect("stream");
    while let Some(chunk) = stream.next().await {
        match chunk.source {
            StreamSource::Stdout => stdout.extend_from_slice(&chunk.data),
            StreamSource::Stderr => stderr.extend_from_slice(&chunk.data),
        }
    }
    assert_eq!(stdout, b"out\n");
    assert_eq!(stderr, b"err\n");
    assert_eq!(process.wait(None).await.expect("wait"), ExitStatus::Exited(0));

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn stdin_feeds_the_child() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run("cat", RunOptions::default())
        .await
        .expect("run");
    process.send(b"hello\n").await.expect("send");
    process.close_stdin();

    let (stdout, stderr) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"hello\n");
    assert_eq!(stderr, b"");

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn timeout_kills_the_whole_group() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run(
            "sleep 5",
            RunOptions {
                timeout: Some(Duration::from_millis(200)),
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");
    let pid = process.pid();

    let started = Instant::now();
    let err = process.wait(None).await.expect_err("must time out");
    assert!(matches!(err, SandboxError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(process.status(), Some(ExitStatus::TimedOut));

    // The helper and its descendants must be gone.
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err());

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn stream_lines_splits_on_newlines() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run("printf 'one\\ntwo\\nthree'", RunOptions::default())
        .await
        .expect("run");
    let mut lines = process.stream_lines().expect("lines");

    assert_eq!(lines.next().await.expect("line").data, b"one\n");
    assert_eq!(lines.next().await.expect("line").data, b"two\n");
    assert_eq!(lines.next().await.expect("line").data, b"three");
    assert!(lines.next().await.is_none());

    process.wait(None).await.expect("wait");
    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn run_script_matches_manual_file_execution() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run_script(
            "echo from-script",
            ScriptOptions {
                run_command: "sh".to_string(),
                extension: "sh".to_string(),
                run: RunOptions::default(),
            },
        )
        .await
        .expect("run_script");
    let (stdout, _) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"from-script\n");

    // The serialized script is observable inside the session directory.
    let work_dir = sandbox.work_dir().expect("work dir").to_path_buf();
    let scripts: Vec<_> = std::fs::read_dir(&work_dir)
        .expect("read work dir")
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("script_") && name.ends_with(".sh")
        })
        .collect();
    assert_eq!(scripts.len(), 1);

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn curated_environment_inside_the_sandbox() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run("echo $HOME:$USER:$PWD", RunOptions::default())
        .await
        .expect("run");
    let (stdout, _) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"/home/sandbox:sandbox:/home/sandbox\n");

    let mut process = sandbox
        .run("hostname", RunOptions::default())
        .await
        .expect("run");
    let (stdout, _) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"sandbox\n");

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn isolated_sandbox_has_no_outbound_network() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    // No interfaces besides (down) loopback: any connect attempt must fail.
    let mut process = sandbox
        .run("getent hosts example.com", RunOptions::default())
        .await
        .expect("run");
    let status = process.wait(None).await.expect("wait");
    assert!(!status.success());

    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn close_terminates_abandoned_children() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let process = sandbox
        .run("sleep 60", RunOptions::default())
        .await
        .expect("run");
    let pid = process.pid();
    // The caller walks away without waiting; close must still terminate.
    drop(process);

    sandbox.close().await.expect("close");
    assert_eq!(sandbox.state(), SandboxState::Closed);
    // The group got SIGKILL; nothing is left running under that pgid.
    assert!(nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), None).is_err());

    // Idempotent.
    sandbox.close().await.expect("second close");
}

#[tokio::test]
async fn session_directory_is_deleted_unless_caller_provided() {
    let Some(rootfs) = test_rootfs() else { return };

    // Engine-allocated: gone after close.
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs.clone())).await;
    let work_dir = sandbox.work_dir().expect("work dir").to_path_buf();
    assert!(work_dir.exists());
    sandbox.close().await.expect("close");
    assert!(!work_dir.exists());

    // Caller-provided: files survive across sessions.
    let keep = tempfile::tempdir().expect("tempdir");
    let pinned = keep.path().join("session");
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs.clone()).work_dir(&pinned)).await;
    let mut process = sandbox
        .run("echo persistent > kept.txt", RunOptions::default())
        .await
        .expect("run");
    process.wait(None).await.expect("wait");
    sandbox.close().await.expect("close");
    assert!(pinned.join("kept.txt").exists());

    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs).work_dir(&pinned)).await;
    let mut process = sandbox
        .run("cat kept.txt", RunOptions::default())
        .await
        .expect("run");
    let (stdout, _) = process.communicate().await.expect("communicate");
    assert_eq!(stdout, b"persistent\n");
    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn pty_merges_output_into_one_stream() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run(
            "echo visible; echo also-visible 1>&2",
            RunOptions {
                io: IoMode::Pty,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");
    assert!(process.merged_output());

    let (stdout, stderr) = process.communicate().await.expect("communicate");
    let merged = String::from_utf8_lossy(&stdout);
    assert!(merged.contains("visible"));
    assert!(merged.contains("also-visible"));
    assert_eq!(stderr, b"");

    process.close_pty();
    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn pty_window_size_is_adjustable() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run(
            "sleep 0.3; stty size",
            RunOptions {
                io: IoMode::Pty,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");
    process.set_terminal_size(48, 120).expect("resize");

    let (stdout, _) = process.communicate().await.expect("communicate");
    assert!(String::from_utf8_lossy(&stdout).contains("48 120"));

    process.close_pty();
    sandbox.close().await.expect("close");
}

#[tokio::test]
async fn pipe_mode_without_stdin_ignores_send() {
    let Some(rootfs) = test_rootfs() else { return };
    let mut sandbox = open_sandbox(SandboxConfig::new(rootfs)).await;

    let mut process = sandbox
        .run(
            "true",
            RunOptions {
                io: IoMode::Pipe {
                    stdin: false,
                    stdout: true,
                    stderr: true,
                },
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");

    // send and close_stdin are no-ops when stdin was not requested.
    process.send(b"data").await.expect("send is a no-op");
    process.close_stdin();

    process.wait(None).await.expect("wait");
    sandbox.close().await.expect("close");
}

fn overlay_available() -> bool {
    if which::which("fuse-overlayfs").is_err() {
        eprintln!("skipping: fuse-overlayfs not installed");
        return false;
    }
    true
}

#[tokio::test]
async fn overlay_captures_writes_in_the_upper_layer() {
    let Some(rootfs) = test_rootfs() else { return };
    if !overlay_available() {
        return;
    }

    let keep = tempfile::tempdir().expect("tempdir");
    let overlay_dir = keep.path().join("overlay");
    let mut sandbox = open_sandbox(
        SandboxConfig::new(rootfs)
            .overlay(true)
            .overlay_dir(&overlay_dir),
    )
    .await;
    let mount = sandbox.overlay_mount().expect("overlay mount").to_path_buf();
    assert!(mount.join("bin").exists() || mount.join("usr").exists());

    let mut process = sandbox
        .run("echo scribble > /note.txt", RunOptions::default())
        .await
        .expect("run");
    process.wait(None).await.expect("wait");

    // The write landed in the upper layer, not the cached rootfs.
    assert!(overlay_dir.join("upper/note.txt").exists());

    sandbox.close().await.expect("close");
    // Caller-provided overlay_dir survives; the mount itself is gone.
    assert!(overlay_dir.join("upper/note.txt").exists());
    assert!(!mount.join("note.txt").exists());
}

#[tokio::test]
async fn persisted_overlay_outlives_close() {
    let Some(rootfs) = test_rootfs() else { return };
    if !overlay_available() {
        return;
    }

    let keep = tempfile::tempdir().expect("tempdir");
    let overlay_dir = keep.path().join("overlay");
    let mut sandbox = open_sandbox(
        SandboxConfig::new(rootfs)
            .overlay(true)
            .overlay_dir(&overlay_dir)
            .persist_overlay(true),
    )
    .await;
    let mount = sandbox.overlay_mount().expect("overlay mount").to_path_buf();

    let mut process = sandbox
        .run("echo kept > /installed.txt", RunOptions::default())
        .await
        .expect("run");
    process.wait(None).await.expect("wait");

    sandbox.close().await.expect("close");
    // The mount is still live and still shows the write.
    assert_eq!(
        std::fs::read(mount.join("installed.txt")).expect("read through mount"),
        b"kept\n"
    );

    // Caller's cleanup responsibility from here on.
    let unmounted = ["fusermount3", "fusermount"].iter().any(|cmd| {
        std::process::Command::new(cmd)
            .arg("-u")
            .arg(&mount)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    });
    assert!(unmounted, "manual unmount of the persisted overlay failed");
}

#[tokio::test]
async fn outbound_network_reaches_the_internet() {
    let Some(rootfs) = test_rootfs() else { return };
    if which::which("slirp4netns").is_err() || which::which("nsenter").is_err() {
        eprintln!("skipping: slirp4netns/nsenter not installed");
        return;
    }
    if std::env::var_os("BURROW_TEST_ONLINE").is_none() {
        eprintln!("skipping: BURROW_TEST_ONLINE not set");
        return;
    }

    let mut sandbox = open_sandbox(
        SandboxConfig::new(rootfs)
            .network(burrow_sandbox::NetworkMode::Outbound {
                host_loopback: false,
            })
            .default_timeout(Some(Duration::from_secs(30))),
    )
    .await;

    let mut process = sandbox
        .run("getent hosts example.com", RunOptions::default())
        .await
        .expect("run");
    let (stdout, _) = process.communicate().await.expect("communicate");
    assert_eq!(process.status(), Some(ExitStatus::Exited(0)));
    assert!(!stdout.is_empty());

    sandbox.close().await.expect("close");
}
