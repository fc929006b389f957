//! Supervision of a sandboxed child process.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;

use crate::error::SandboxError;
use crate::pty::PtyMaster;
use crate::runner::Spawned;

const CHUNK_SIZE: usize = 4096;
const CHANNEL_CAP: usize = 32;
/// Grace between SIGTERM and SIGKILL when tearing a child down.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Which child stream a chunk came from. PTY output is always `Stdout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }

    fn index(&self) -> usize {
        match self {
            StreamSource::Stdout => 0,
            StreamSource::Stderr => 1,
        }
    }
}

/// Terminal state of a sandboxed process. Exactly one is ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signalled(i32),
    /// A wait deadline elapsed and the process group was killed.
    TimedOut,
    /// Terminated by `close()` before exiting on its own.
    Cancelled,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// One chunk of child output, exactly as a single read returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub source: StreamSource,
    pub data: Vec<u8>,
}

/// One line of child output, newline included except at EOF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: StreamSource,
    pub data: Vec<u8>,
}

impl OutputLine {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Shared terminal-state cell, visible to the coordinator after the caller
/// takes ownership of the process handle.
#[derive(Debug)]
pub(crate) struct ProcessState {
    pid: u32,
    terminal: parking_lot::Mutex<Option<ExitStatus>>,
}

impl ProcessState {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            terminal: parking_lot::Mutex::new(None),
        }
    }

    /// Record the terminal state; later transitions are ignored.
    pub(crate) fn set(&self, status: ExitStatus) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(status);
        }
    }

    pub(crate) fn terminal(&self) -> Option<ExitStatus> {
        *self.terminal.lock()
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }
}

/// Finite, non-restartable sequence of output chunks.
///
/// In pipe mode, chunks interleave stdout and stderr in arrival order; each
/// stream's own byte order is preserved. The bounded channel applies
/// backpressure to the reading tasks.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputChunk>,
}

impl OutputStream {
    fn start(readers: Readers) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        match readers {
            Readers::Pipes { stdout, stderr } => {
                if let Some(stdout) = stdout {
                    tokio::spawn(pump(stdout, StreamSource::Stdout, tx.clone()));
                }
                if let Some(stderr) = stderr {
                    tokio::spawn(pump(stderr, StreamSource::Stderr, tx.clone()));
                }
            }
            Readers::Pty(master) => {
                tokio::spawn(pump_pty(master, tx.clone()));
            }
        }
        Self { rx }
    }

    /// Next chunk, or `None` once every child output has closed.
    pub async fn next(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (mpsc::Sender<OutputChunk>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        (tx, Self { rx })
    }
}

/// Line-coalescing wrapper over [`OutputStream`].
///
/// Partial reads accumulate per source until a newline arrives; a trailing
/// partial line is emitted at EOF.
pub struct LineStream {
    inner: OutputStream,
    buffers: [Vec<u8>; 2],
    pending: VecDeque<OutputLine>,
    finished: bool,
}

impl LineStream {
    fn new(inner: OutputStream) -> Self {
        Self {
            inner,
            buffers: [Vec::new(), Vec::new()],
            pending: VecDeque::new(),
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<OutputLine> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.finished {
                return None;
            }
            match self.inner.next().await {
                Some(chunk) => {
                    let buffer = &mut self.buffers[chunk.source.index()];
                    buffer.extend_from_slice(&chunk.data);
                    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                        let rest = buffer.split_off(pos + 1);
                        let data = std::mem::replace(buffer, rest);
                        self.pending.push_back(OutputLine {
                            source: chunk.source,
                            data,
                        });
                    }
                }
                None => {
                    self.finished = true;
                    for source in [StreamSource::Stdout, StreamSource::Stderr] {
                        let buffer = &mut self.buffers[source.index()];
                        if !buffer.is_empty() {
                            let data = std::mem::take(buffer);
                            self.pending.push_back(OutputLine { source, data });
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum Readers {
    Pipes {
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    },
    Pty(Arc<PtyMaster>),
}

/// A supervised child running under the sandbox helper.
///
/// Dropping the handle without closing force-kills the process group; the
/// coordinator also terminates any still-live children at close. Cancelling
/// an in-flight `wait` or `communicate` future does not kill the child.
#[derive(Debug)]
pub struct SandboxedProcess {
    child: Child,
    pid: u32,
    stdin: Option<tokio::process::ChildStdin>,
    readers: Option<Readers>,
    pty: Option<Arc<PtyMaster>>,
    merged_output: bool,
    default_timeout: Option<Duration>,
    state: Arc<ProcessState>,
    closed: bool,
}

impl SandboxedProcess {
    pub(crate) fn new(
        spawned: Spawned,
        default_timeout: Option<Duration>,
    ) -> Result<Self, SandboxError> {
        let Spawned { mut child, pty } = spawned;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Setup("child exited before supervision".to_string()))?;

        let stdin = child.stdin.take();
        let (readers, pty, merged_output) = match pty {
            Some(master) => {
                let master = Arc::new(master);
                (Readers::Pty(Arc::clone(&master)), Some(master), true)
            }
            None => (
                Readers::Pipes {
                    stdout: child.stdout.take(),
                    stderr: child.stderr.take(),
                },
                None,
                false,
            ),
        };

        Ok(Self {
            child,
            pid,
            stdin,
            readers: Some(readers),
            pty,
            merged_output,
            default_timeout,
            state: Arc::new(ProcessState::new(pid)),
            closed: false,
        })
    }

    /// Host-visible PID of the sandbox helper (also its process-group id).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether stdout and stderr are one merged stream (PTY mode).
    pub fn merged_output(&self) -> bool {
        self.merged_output
    }

    /// Terminal state, once one has been recorded.
    pub fn status(&self) -> Option<ExitStatus> {
        self.state.terminal()
    }

    pub(crate) fn state(&self) -> Arc<ProcessState> {
        Arc::clone(&self.state)
    }

    /// Append bytes to the child's input (PTY master in PTY mode).
    ///
    /// A no-op in pipe mode when stdin was not requested or is already
    /// closed.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), SandboxError> {
        if let Some(pty) = &self.pty {
            pty.write_all(data).await?;
            return Ok(());
        }
        let Some(stdin) = self.stdin.as_mut() else {
            debug!("send ignored; stdin is not piped");
            return Ok(());
        };
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin to signal EOF. No-op when stdin was not requested.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Take the output stream. Finite and non-restartable; a second call
    /// fails.
    pub fn stream(&mut self) -> Result<OutputStream, SandboxError> {
        let readers = self.readers.take().ok_or(SandboxError::StreamTaken)?;
        Ok(OutputStream::start(readers))
    }

    /// Take the output stream, split into lines.
    pub fn stream_lines(&mut self) -> Result<LineStream, SandboxError> {
        Ok(LineStream::new(self.stream()?))
    }

    /// Drain both streams to completion and reap the child.
    ///
    /// In PTY mode the merged output is returned as stdout and stderr is
    /// empty. Uses the per-process default timeout unless overridden.
    pub async fn communicate(&mut self) -> Result<(Vec<u8>, Vec<u8>), SandboxError> {
        self.communicate_with_timeout(None).await
    }

    pub async fn communicate_with_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, Vec<u8>), SandboxError> {
        let stream = self.stream()?;
        // EOF on stdin, so filters drain instead of blocking on input.
        self.stdin.take();
        let limit = timeout.or(self.default_timeout);

        let outcome = {
            let fut = drain_and_wait(&mut self.child, stream);
            match limit {
                None => Ok(fut.await),
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
            }
        };
        match outcome {
            Ok(result) => {
                let (stdout, stderr, status) = result?;
                self.state.set(status_from(status));
                Ok((stdout, stderr))
            }
            Err(limit) => {
                self.terminate_cascade().await;
                self.state.set(ExitStatus::TimedOut);
                Err(SandboxError::Timeout(limit))
            }
        }
    }

    /// Block until the child reaches a terminal state or the deadline
    /// elapses. On timeout the whole process group is terminated
    /// (SIGTERM, short grace, SIGKILL) before the error is returned.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, SandboxError> {
        let limit = timeout.or(self.default_timeout);
        let outcome = {
            let fut = self.child.wait();
            match limit {
                None => Ok(fut.await),
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
            }
        };
        match outcome {
            Ok(status) => {
                let exit = status_from(status?);
                self.state.set(exit);
                Ok(exit)
            }
            Err(limit) => {
                self.terminate_cascade().await;
                self.state.set(ExitStatus::TimedOut);
                Err(SandboxError::Timeout(limit))
            }
        }
    }

    /// Like [`wait`](Self::wait), but a non-zero exit is reported as an
    /// error, distinguishing command failure from engine failure.
    pub async fn wait_checked(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus, SandboxError> {
        let status = self.wait(timeout).await?;
        if !status.success() {
            return Err(SandboxError::CommandFailed(status));
        }
        Ok(status)
    }

    /// Apply a window-size ioctl to the PTY. Fails in pipe mode.
    pub fn set_terminal_size(&self, rows: u16, cols: u16) -> Result<(), SandboxError> {
        let pty = self.pty.as_ref().ok_or(SandboxError::NoPty)?;
        pty.set_winsize(rows, cols)?;
        Ok(())
    }

    /// Release the PTY master. If the child is still running it receives
    /// SIGHUP first, the way a vanishing terminal would deliver it. Safe to
    /// call repeatedly and in pipe mode.
    pub fn close_pty(&mut self) {
        if let Some(pty) = self.pty.take() {
            if self.state.terminal().is_none() {
                let _ = signal::killpg(Pid::from_raw(self.pid as i32), Signal::SIGHUP);
            }
            drop(pty);
        }
    }

    /// Request graceful termination of the process group.
    pub fn terminate(&self) -> Result<(), SandboxError> {
        self.signal_group(Signal::SIGTERM)
    }

    /// Force-kill the process group.
    pub fn kill(&self) -> Result<(), SandboxError> {
        self.signal_group(Signal::SIGKILL)
    }

    fn signal_group(&self, signal: Signal) -> Result<(), SandboxError> {
        signal::killpg(Pid::from_raw(self.pid as i32), signal)
            .map_err(|errno| SandboxError::Io(std::io::Error::from_raw_os_error(errno as i32)))
    }

    /// Release descriptors and reap the child, force-killing the group
    /// after a short grace period if it is still running. Idempotent.
    pub async fn close(&mut self) -> Result<(), SandboxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stdin.take();
        self.readers.take();

        match self.child.try_wait()? {
            None => {
                self.terminate_cascade().await;
                self.state.set(ExitStatus::Cancelled);
            }
            Some(status) => {
                self.state.set(status_from(status));
            }
        }
        self.pty.take();
        Ok(())
    }

    async fn terminate_cascade(&mut self) {
        debug!("terminating process group {}", self.pid);
        let _ = signal::killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = signal::killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
    }
}

impl Drop for SandboxedProcess {
    fn drop(&mut self) {
        if !self.closed && self.state.terminal().is_none() {
            let _ = signal::killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
    }
}

async fn drain_and_wait(
    child: &mut Child,
    mut stream: OutputStream,
) -> Result<(Vec<u8>, Vec<u8>, std::process::ExitStatus), SandboxError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk.source {
            StreamSource::Stdout => stdout.extend_from_slice(&chunk.data),
            StreamSource::Stderr => stderr.extend_from_slice(&chunk.data),
        }
    }
    let status = child.wait().await?;
    Ok((stdout, stderr, status))
}

async fn pump<R>(mut reader: R, source: StreamSource, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                let chunk = OutputChunk {
                    source,
                    data: buf[..read].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("{} read error: {err}", source.as_str());
                break;
            }
        }
    }
}

async fn pump_pty(master: Arc<PtyMaster>, tx: mpsc::Sender<OutputChunk>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match master.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                let chunk = OutputChunk {
                    source: StreamSource::Stdout,
                    data: buf[..read].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("pty read error: {err}");
                break;
            }
        }
    }
}

fn status_from(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => ExitStatus::Exited(code),
        None => ExitStatus::Signalled(status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(source: StreamSource, data: &[u8]) -> OutputChunk {
        OutputChunk {
            source,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn lines_coalesce_partial_chunks() {
        let (tx, stream) = OutputStream::test_pair();
        let mut lines = LineStream::new(stream);

        tx.send(chunk(StreamSource::Stdout, b"li")).await.unwrap();
        tx.send(chunk(StreamSource::Stdout, b"ne1\nline2\npar"))
            .await
            .unwrap();
        tx.send(chunk(StreamSource::Stdout, b"tial")).await.unwrap();
        drop(tx);

        let first = lines.next().await.unwrap();
        assert_eq!(first.data, b"line1\n");
        assert_eq!(lines.next().await.unwrap().data, b"line2\n");
        // Trailing partial is emitted at EOF, without a newline.
        assert_eq!(lines.next().await.unwrap().data, b"partial");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn lines_split_per_source() {
        let (tx, stream) = OutputStream::test_pair();
        let mut lines = LineStream::new(stream);

        tx.send(chunk(StreamSource::Stdout, b"out-")).await.unwrap();
        tx.send(chunk(StreamSource::Stderr, b"err-line\n"))
            .await
            .unwrap();
        tx.send(chunk(StreamSource::Stdout, b"line\n")).await.unwrap();
        drop(tx);

        let first = lines.next().await.unwrap();
        assert_eq!(first.source, StreamSource::Stderr);
        assert_eq!(first.data, b"err-line\n");

        let second = lines.next().await.unwrap();
        assert_eq!(second.source, StreamSource::Stdout);
        assert_eq!(second.data, b"out-line\n");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let (tx, stream) = OutputStream::test_pair();
        drop(tx);
        let mut lines = LineStream::new(stream);
        assert!(lines.next().await.is_none());
    }

    #[test]
    fn exit_status_helpers() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::TimedOut.success());
        assert_eq!(ExitStatus::Exited(7).code(), Some(7));
        assert_eq!(ExitStatus::Signalled(9).code(), None);
    }

    #[test]
    fn terminal_state_is_recorded_once() {
        let state = ProcessState::new(1234);
        assert_eq!(state.terminal(), None);
        state.set(ExitStatus::TimedOut);
        state.set(ExitStatus::Exited(0));
        assert_eq!(state.terminal(), Some(ExitStatus::TimedOut));
        assert_eq!(state.pid(), 1234);
    }

    #[test]
    fn line_text_decodes_lossily() {
        let line = OutputLine {
            source: StreamSource::Stdout,
            data: vec![b'o', b'k', 0xff],
        };
        assert_eq!(line.text(), "ok\u{fffd}");
    }
}
