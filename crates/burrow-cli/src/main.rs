//! `burrow` command-line front-end.
//!
//! Thin shell over the engine crates: run a command in a fresh sandbox,
//! build a rootfs archive from a Dockerfile, or clear the extraction cache.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use burrow_rootfs::RootfsCache;
use burrow_sandbox::{
    ExitStatus, NetworkMode, RunOptions, Sandbox, SandboxConfig, StreamSource,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::warn;
use tokio::process::Command;

/// Run commands in throwaway rootfs sandboxes.
#[derive(Parser)]
#[command(name = "burrow", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command in a new sandbox.
    Run(RunArgs),
    /// Build a rootfs archive from a Dockerfile (needs docker and zstd).
    Rootfs(RootfsArgs),
    /// Delete the per-user rootfs extraction cache.
    ClearCache,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the rootfs archive (tar, optionally compressed)
    #[arg(long)]
    rootfs: PathBuf,
    /// Writable session directory, kept after exit (default: throwaway)
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Extract the rootfs here instead of the content-addressed cache
    #[arg(long)]
    rootfs_dir: Option<PathBuf>,
    /// Layer a writable FUSE overlay over the rootfs
    #[arg(long)]
    overlay: bool,
    /// Directory for the overlay's upper/work/mount trees
    #[arg(long)]
    overlay_dir: Option<PathBuf>,
    /// Leave the overlay mounted after exit (requires --overlay-dir)
    #[arg(long)]
    persist_overlay: bool,
    /// Network policy
    #[arg(long, value_enum, default_value_t = NetworkArg::Isolated)]
    network: NetworkArg,
    /// Command timeout in seconds (default: none)
    #[arg(long)]
    timeout: Option<f64>,
    /// User to run as inside the sandbox
    #[arg(long, default_value = "sandbox")]
    user: String,
    /// Shell command to run (use -- before commands starting with -)
    #[arg(trailing_var_arg = true, required = true)]
    cmd: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NetworkArg {
    /// Share the host's network namespace
    Host,
    /// New, empty network namespace
    Isolated,
    /// slirp4netns outbound, host loopback unreachable
    Outbound,
    /// slirp4netns outbound with host loopback mapped
    OutboundLoopback,
}

impl From<NetworkArg> for NetworkMode {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Host => NetworkMode::Host,
            NetworkArg::Isolated => NetworkMode::Isolated,
            NetworkArg::Outbound => NetworkMode::Outbound {
                host_loopback: false,
            },
            NetworkArg::OutboundLoopback => NetworkMode::Outbound {
                host_loopback: true,
            },
        }
    }
}

#[derive(clap::Args)]
struct RootfsArgs {
    /// Path to the Dockerfile
    dockerfile: PathBuf,
    /// Output path for the archive (zstd-compressed tar)
    output: PathBuf,
    /// zstd compression level
    #[arg(long, default_value_t = 6)]
    compress_level: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = env_logger::builder().format_timestamp_millis().try_init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Rootfs(args) => cmd_rootfs(args).await?,
        Commands::ClearCache => {
            RootfsCache::new()?.clear()?;
            0
        }
    };
    std::process::exit(code);
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = SandboxConfig::new(&args.rootfs)
        .network(args.network.into())
        .overlay(args.overlay)
        .persist_overlay(args.persist_overlay)
        .user(args.user)
        .default_timeout(args.timeout.map(Duration::from_secs_f64));
    if let Some(dir) = args.work_dir {
        config = config.work_dir(dir);
    }
    if let Some(dir) = args.rootfs_dir {
        config = config.rootfs_dir(dir);
    }
    if let Some(dir) = args.overlay_dir {
        config = config.overlay_dir(dir);
    }

    let mut sandbox = Sandbox::new(config)?;
    sandbox.open().await?;

    let command = args.cmd.join(" ");
    let result = run_streaming(&mut sandbox, &command).await;

    if let Err(err) = sandbox.close().await {
        warn!("sandbox teardown reported an error: {err}");
    }
    result
}

/// Run one command, copying its output to the terminal as it arrives.
async fn run_streaming(sandbox: &mut Sandbox, command: &str) -> anyhow::Result<i32> {
    let mut process = sandbox.run(command, RunOptions::default()).await?;
    let mut stream = process.stream()?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    while let Some(chunk) = stream.next().await {
        match chunk.source {
            StreamSource::Stdout => {
                stdout.write_all(&chunk.data)?;
                stdout.flush()?;
            }
            StreamSource::Stderr => {
                stderr.write_all(&chunk.data)?;
                stderr.flush()?;
            }
        }
    }

    let status = process.wait(None).await?;
    Ok(match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signalled(signal) => 128 + signal,
        ExitStatus::TimedOut | ExitStatus::Cancelled => 124,
    })
}

async fn cmd_rootfs(args: RootfsArgs) -> anyhow::Result<i32> {
    if !args.dockerfile.exists() {
        bail!("Dockerfile not found: {}", args.dockerfile.display());
    }

    // Stale container from an aborted earlier build; removal may fail.
    let _ = Command::new("docker")
        .args(["rm", "-f", "burrow_rootfs"])
        .status()
        .await;

    let status = Command::new("docker")
        .args(["build", "-t", "burrow_rootfs", "-f"])
        .arg(&args.dockerfile)
        .arg(".")
        .status()
        .await
        .context("running docker build")?;
    if !status.success() {
        bail!("docker build failed");
    }

    let status = Command::new("docker")
        .args(["create", "--name", "burrow_rootfs", "burrow_rootfs"])
        .status()
        .await
        .context("running docker create")?;
    if !status.success() {
        bail!("docker create failed");
    }

    let pipeline = format!(
        "docker export burrow_rootfs | zstd -{} -o {}",
        args.compress_level,
        args.output.display()
    );
    let status = Command::new("bash")
        .args(["-c", &pipeline])
        .status()
        .await
        .context("exporting the container filesystem")?;

    let _ = Command::new("docker")
        .args(["rm", "-f", "burrow_rootfs"])
        .status()
        .await;

    if !status.success() {
        bail!("docker export pipeline failed");
    }
    println!("Successfully generated rootfs: {}", args.output.display());
    Ok(0)
}
