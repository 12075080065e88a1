use std::io::{self, Read, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use shellstream_core::{ExecOutcome, TerminalSize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecRequest, PipeReader, PipeWriter, RunningTask, StdioPipes, TaskRuntime};

const PTY_BUFFER: usize = 8192;

/// Runs each request as a local child process.
///
/// Non-terminal requests get plain pipes; terminal requests run inside a
/// pseudo-terminal that follows the session's resize events.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    initial_size: TerminalSize,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self {
            initial_size: TerminalSize::new(24, 80),
        }
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_size(mut self, size: TerminalSize) -> Self {
        self.initial_size = size;
        self
    }

    fn start_piped(&self, request: &ExecRequest) -> io::Result<Box<dyn RunningTask>> {
        let (program, args) = split_command(request)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(stdio_for(request.stdin))
            .stdout(stdio_for(request.stdout))
            .stderr(stdio_for(request.stderr))
            .kill_on_drop(true)
            .spawn()?;

        let pipes = StdioPipes {
            stdin: child.stdin.take().map(|pipe| Box::new(pipe) as PipeWriter),
            stdout: child.stdout.take().map(|pipe| Box::new(pipe) as PipeReader),
            stderr: child.stderr.take().map(|pipe| Box::new(pipe) as PipeReader),
        };
        debug!(exec_id = %request.id, pid = ?child.id(), "spawned piped process");

        Ok(Box::new(PipedTask {
            child,
            pipes: Some(pipes),
        }))
    }

    fn start_pty(
        &self,
        request: &ExecRequest,
        mut resize: mpsc::UnboundedReceiver<TerminalSize>,
    ) -> io::Result<Box<dyn RunningTask>> {
        let (program, args) = split_command(request)?;
        let pair = native_pty_system()
            .openpty(pty_size(self.initial_size))
            .map_err(pty_error)?;

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        builder.cwd(std::env::current_dir()?);
        builder.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(builder).map_err(pty_error)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(pty_error)?;
        let writer = pair.master.take_writer().map_err(pty_error)?;
        let master = Arc::new(Mutex::new(pair.master));

        let handle = Handle::current();
        let stdout = bridge_reader(reader, handle.clone())?;
        let stdout = if request.stdout {
            Some(stdout)
        } else {
            // Nobody reads the terminal, but it must not fill up.
            tokio::spawn(async move {
                let mut stdout = stdout;
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
            None
        };
        let stdin = if request.stdin {
            Some(bridge_writer(writer, handle)?)
        } else {
            None
        };

        let resize_master = Arc::clone(&master);
        let exec_id = request.id.clone();
        let resize_task = tokio::spawn(async move {
            while let Some(size) = resize.recv().await {
                debug!(exec_id = %exec_id, rows = size.rows, cols = size.cols, "resizing terminal");
                if let Err(err) = resize_master.lock().resize(pty_size(size)) {
                    warn!(exec_id = %exec_id, error = %err, "terminal resize failed");
                }
            }
        });
        debug!(exec_id = %request.id, "spawned process in terminal");

        Ok(Box::new(PtyTask {
            child: Some(child),
            _master: master,
            pipes: Some(StdioPipes {
                stdin,
                stdout,
                stderr: None,
            }),
            resize_task,
            outcome: None,
        }))
    }
}

#[async_trait]
impl TaskRuntime for ProcessRuntime {
    async fn start(
        &self,
        request: &ExecRequest,
        resize: mpsc::UnboundedReceiver<TerminalSize>,
    ) -> io::Result<Box<dyn RunningTask>> {
        if request.tty {
            self.start_pty(request, resize)
        } else {
            self.start_piped(request)
        }
    }
}

struct PipedTask {
    child: tokio::process::Child,
    pipes: Option<StdioPipes>,
}

#[async_trait]
impl RunningTask for PipedTask {
    fn take_stdio(&mut self) -> StdioPipes {
        self.pipes.take().unwrap_or_default()
    }

    async fn wait(&mut self) -> ExecOutcome {
        match self.child.wait().await {
            Ok(status) => outcome_from_status(status),
            Err(err) => ExecOutcome::Failed(err.to_string()),
        }
    }
}

struct PtyTask {
    child: Option<Box<dyn Child + Send + Sync>>,
    _master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    pipes: Option<StdioPipes>,
    resize_task: JoinHandle<()>,
    outcome: Option<ExecOutcome>,
}

#[async_trait]
impl RunningTask for PtyTask {
    fn take_stdio(&mut self) -> StdioPipes {
        self.pipes.take().unwrap_or_default()
    }

    async fn wait(&mut self) -> ExecOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(mut child) = self.child.take() else {
            return ExecOutcome::Failed("terminal process is gone".into());
        };
        let outcome = match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => ExecOutcome::from_exit_code(status.exit_code() as i32),
            Ok(Err(err)) => ExecOutcome::Failed(err.to_string()),
            Err(err) => ExecOutcome::Failed(err.to_string()),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for PtyTask {
    fn drop(&mut self) {
        self.resize_task.abort();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
        }
    }
}

fn split_command(request: &ExecRequest) -> io::Result<(&str, &[String])> {
    match request.command.split_first() {
        Some((program, args)) if !program.is_empty() => Ok((program.as_str(), args)),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command")),
    }
}

fn stdio_for(attached: bool) -> Stdio {
    if attached {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(err: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[cfg(unix)]
fn outcome_from_status(status: ExitStatus) -> ExecOutcome {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExecOutcome::from_exit_code(code),
        (None, Some(signal)) => ExecOutcome::Failed(format!("terminated by signal {signal}")),
        (None, None) => ExecOutcome::Failed(status.to_string()),
    }
}

#[cfg(not(unix))]
fn outcome_from_status(status: ExitStatus) -> ExecOutcome {
    match status.code() {
        Some(code) => ExecOutcome::from_exit_code(code),
        None => ExecOutcome::Failed(status.to_string()),
    }
}

/// Exposes a blocking terminal reader as an async pipe.
fn bridge_reader(mut reader: Box<dyn Read + Send>, handle: Handle) -> io::Result<PipeReader> {
    let (async_end, mut bridge_end) = tokio::io::duplex(PTY_BUFFER);
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; PTY_BUFFER];
            loop {
                let read = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    // EIO once the last slave descriptor closes.
                    Err(_) => break,
                };
                if handle.block_on(bridge_end.write_all(&buf[..read])).is_err() {
                    break;
                }
            }
        })?;
    Ok(Box::new(async_end))
}

/// Exposes a blocking terminal writer as an async pipe; dropping the returned
/// pipe releases the terminal writer.
fn bridge_writer(mut writer: Box<dyn Write + Send>, handle: Handle) -> io::Result<PipeWriter> {
    let (async_end, mut bridge_end) = tokio::io::duplex(PTY_BUFFER);
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            let mut buf = [0u8; PTY_BUFFER];
            loop {
                let read = match handle.block_on(bridge_end.read(&mut buf)) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                if writer
                    .write_all(&buf[..read])
                    .and_then(|()| writer.flush())
                    .is_err()
                {
                    break;
                }
            }
        })?;
    Ok(Box::new(async_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ExecRequest {
        let mut request = ExecRequest::new(["sh", "-c", script]);
        request.stdin = true;
        request
    }

    #[test_timeout::tokio_timeout_test]
    async fn piped_process_reports_exit_code() {
        let runtime = ProcessRuntime::new();
        let (_resize_tx, resize_rx) = mpsc::unbounded_channel();
        let mut task = runtime
            .start(&shell("cat; echo done >&2; exit 3"), resize_rx)
            .await
            .expect("spawn");
        let mut pipes = task.take_stdio();

        let mut stdin = pipes.stdin.take().expect("stdin pipe");
        stdin.write_all(b"ping").await.expect("write stdin");
        drop(stdin);

        let mut stdout = String::new();
        pipes
            .stdout
            .take()
            .expect("stdout pipe")
            .read_to_string(&mut stdout)
            .await
            .expect("read stdout");
        let mut stderr = String::new();
        pipes
            .stderr
            .take()
            .expect("stderr pipe")
            .read_to_string(&mut stderr)
            .await
            .expect("read stderr");

        assert_eq!(stdout, "ping");
        assert_eq!(stderr, "done\n");
        assert_eq!(task.wait().await, ExecOutcome::ExitCode(3));
        assert!(task.take_stdio().stdout.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_program_fails_to_start() {
        let runtime = ProcessRuntime::new();
        let (_resize_tx, resize_rx) = mpsc::unbounded_channel();
        let request = ExecRequest::new(["/definitely/not/a/program"]);
        assert!(runtime.start(&request, resize_rx).await.is_err());
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn terminal_process_sees_resizes() {
        let runtime = ProcessRuntime::new();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let mut request = ExecRequest::new(["sh", "-c", "read line; stty size"]);
        request.stdin = true;
        request.tty = true;
        let mut task = runtime.start(&request, resize_rx).await.expect("spawn");
        let mut pipes = task.take_stdio();
        assert!(pipes.stderr.is_none());

        resize_tx
            .send(TerminalSize::new(30, 100))
            .expect("resize queued");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mut stdin = pipes.stdin.take().expect("stdin pipe");
        stdin.write_all(b"go\n").await.expect("write");

        let mut output = String::new();
        pipes
            .stdout
            .take()
            .expect("stdout pipe")
            .read_to_string(&mut output)
            .await
            .expect("read terminal");
        assert!(output.contains("30 100"), "unexpected terminal output: {output:?}");
        assert_eq!(task.wait().await, ExecOutcome::Success);
    }
}
