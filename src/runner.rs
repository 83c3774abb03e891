use crate::error::{PipelineError, Result};

use async_trait::async_trait;
use std::{ffi::OsString, fmt, io, process::Stdio};
use tokio::{
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An external executable together with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn failed(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::ExecutionFailed {
            command: self.program.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Receives output lines in the order the process produced them.
pub type LineSink<'a> = &'a mut (dyn FnMut(String) + Send);

/// Runs an external command to completion, streaming its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, handing every line of combined stdout/stderr to
    /// `on_line` as soon as it is read.
    ///
    /// Succeeds only on exit code 0. A launch failure or non-zero exit is
    /// [`PipelineError::ExecutionFailed`], reported after every line has
    /// been delivered. When `cancel` fires the process is killed and
    /// [`PipelineError::Cancelled`] is returned.
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        on_line: LineSink<'_>,
    ) -> Result<()>;
}

/// [`CommandRunner`] backed by real child processes.
///
/// On Unix the tool leads its own process group, so cancelling also stops
/// anything a wrapper command (`conda run ...`, a shell script) started.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        on_line: LineSink<'_>,
    ) -> Result<()> {
        // stdout and stderr share one pipe so their interleaving is kept.
        let pipe = OutputPipe::open().map_err(|e| spec.failed(e.to_string()))?;

        let (mut child, reader) = {
            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .stdin(Stdio::null())
                .stdout(pipe.stdout)
                .stderr(pipe.stderr)
                .kill_on_drop(true);
            #[cfg(unix)]
            command.process_group(0);
            let child = command.spawn().map_err(|e| spec.failed(e.to_string()))?;
            // `command` drops here, closing the parent's write ends.
            (child, pipe.reader)
        };
        info!(command = %spec, pid = ?child.id(), "Started external process");

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let reader = spawn_reader(reader, chunk_tx);
        let mut splitter = LineSplitter::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    reader.abort();
                    terminate(&mut child, spec).await;
                    return Err(PipelineError::Cancelled);
                }
                chunk = chunk_rx.recv() => match chunk {
                    Some(bytes) => splitter.push(&bytes, &mut *on_line),
                    None => break,
                },
            }
        }
        if let Some(line) = splitter.finish() {
            on_line(line);
        }

        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(command = %spec.program, error = %e, "Output stream ended with error"),
            Err(e) => warn!(command = %spec.program, error = %e, "Output reader stopped"),
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, spec).await;
                return Err(PipelineError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| spec.failed(e.to_string()))?,
        };
        debug!(command = %spec.program, ?status, "External process exited");

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(spec.failed(format!("exit code {code}"))),
            None => Err(spec.failed("terminated by signal")),
        }
    }
}

/// Kill the child together with everything in its process group.
async fn terminate(child: &mut Child, spec: &CommandSpec) {
    warn!(command = %spec.program, pid = ?child.id(), "Cancelling external process");
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::{sys::signal::{Signal, killpg}, unistd::Pid};
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(command = %spec.program, error = %e, "Process group already gone");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(command = %spec.program, error = %e, "Failed to kill process");
    }
}

/// One pipe used as both stdout and stderr of a child.
struct OutputPipe {
    stdout: Stdio,
    stderr: Stdio,
    reader: PipeReader,
}

#[cfg(unix)]
type PipeReader = tokio::net::unix::pipe::Receiver;

#[cfg(not(unix))]
type PipeReader = io::PipeReader;

impl OutputPipe {
    #[cfg(unix)]
    fn open() -> io::Result<Self> {
        let (sender, reader) = tokio::net::unix::pipe::pipe()?;
        let writer = sender.into_blocking_fd()?;
        let stderr = writer.try_clone()?;
        Ok(Self {
            stdout: writer.into(),
            stderr: stderr.into(),
            reader,
        })
    }

    #[cfg(not(unix))]
    fn open() -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        let stderr = writer.try_clone()?;
        Ok(Self {
            stdout: writer.into(),
            stderr: stderr.into(),
            reader,
        })
    }
}

/// Forward raw output chunks until end of stream. Aborting the returned
/// task drops the read end.
#[cfg(unix)]
fn spawn_reader(
    mut reader: PipeReader,
    chunks: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<io::Result<()>> {
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if chunks.send(buf[..read].to_vec()).is_err() {
                return Ok(());
            }
        }
    })
}

// TODO: anonymous pipes have no async reader outside Unix; a cancelled run
// here keeps this thread until the tool's descendants close the pipe.
#[cfg(not(unix))]
fn spawn_reader(
    mut reader: PipeReader,
    chunks: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<io::Result<()>> {
    use std::io::Read;

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if chunks.send(buf[..read].to_vec()).is_err() {
                return Ok(());
            }
        }
    })
}

const READ_CHUNK: usize = 8 * 1024;

/// Splits a byte stream into lines on `\n`, `\r` or `\r\n`.
///
/// Progress bars redraw with a bare `\r`, so each redraw becomes its own
/// line. A `\r\n` split across two chunks still counts once.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    line: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(String)) {
        for &byte in bytes {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' | b'\r' => {
                    self.pending_cr = byte == b'\r';
                    emit(String::from_utf8_lossy(&self.line).into_owned());
                    self.line.clear();
                }
                _ => self.line.push(byte),
            }
        }
    }

    /// The unterminated tail, if any.
    pub(crate) fn finish(self) -> Option<String> {
        (!self.line.is_empty()).then(|| String::from_utf8_lossy(&self.line).into_owned())
    }
}
