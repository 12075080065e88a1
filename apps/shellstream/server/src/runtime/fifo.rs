use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use shellstream_core::{ExecOutcome, TerminalSize};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::{ExecRequest, PipeReader, PipeWriter, RunningTask, StdioPipes, TaskRuntime};

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_RETRY: Duration = Duration::from_millis(20);

const STREAMS: [&str; 3] = ["stdin", "stdout", "stderr"];

/// Where a prepared task's exit stands.
#[derive(Debug)]
enum ExitSlot {
    /// Prepared; nothing attached and nothing reported yet.
    Pending,
    /// Reported before a session attached.
    Reported(ExecOutcome),
    /// A session is attached and waiting.
    Waiting(oneshot::Sender<ExecOutcome>),
}

type ExitSlots = Arc<DashMap<String, ExitSlot>>;

/// Attaches sessions to tasks that someone else runs, through named pipes
/// at `<root>/<id>-stdin`, `<root>/<id>-stdout` and `<root>/<id>-stderr`.
///
/// Whoever runs the task reports its exit through an [`ExitReporter`] or the
/// server's exit route. An exit reported before the session attaches is kept
/// until it does. If no exit is reported within the exit timeout after the
/// streams finish, the task is treated as successful.
#[derive(Debug, Clone)]
pub struct FifoRuntime {
    root: PathBuf,
    open_timeout: Duration,
    exit_timeout: Duration,
    exits: ExitSlots,
}

/// Cloneable handle for delivering task exits to waiting sessions.
#[derive(Debug, Clone)]
pub struct ExitReporter {
    exits: ExitSlots,
}

impl ExitReporter {
    /// Returns `false` when `id` was never prepared, already released or
    /// already reported.
    pub fn report_exit(&self, id: &str, outcome: ExecOutcome) -> bool {
        let Some(mut slot) = self.exits.get_mut(id) else {
            return false;
        };
        match std::mem::replace(&mut *slot, ExitSlot::Pending) {
            ExitSlot::Pending => {
                *slot = ExitSlot::Reported(outcome);
                true
            }
            ExitSlot::Waiting(waiter) => {
                *slot = ExitSlot::Reported(outcome.clone());
                waiter.send(outcome).is_ok()
            }
            reported @ ExitSlot::Reported(_) => {
                *slot = reported;
                false
            }
        }
    }
}

impl FifoRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            exits: Arc::new(DashMap::new()),
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exit_reporter(&self) -> ExitReporter {
        ExitReporter {
            exits: Arc::clone(&self.exits),
        }
    }

    pub fn fifo_path(&self, id: &str, stream: &str) -> PathBuf {
        self.root.join(format!("{id}-{stream}"))
    }

    /// Removes whatever pipes exist for `id`.
    pub fn remove(&self, id: &str) -> io::Result<()> {
        for stream in STREAMS {
            match std::fs::remove_file(self.fifo_path(id, stream)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Opening the write end fails with `ENXIO` until the task has the pipe
    /// open for reading, so keep trying until the open timeout.
    async fn open_writer(&self, request: &ExecRequest, stream: &str) -> io::Result<PipeWriter> {
        let path = self.fifo_path(&request.id, stream);
        let open = async {
            loop {
                match pipe::OpenOptions::new().open_sender(&path) {
                    Ok(sender) => return Ok(sender),
                    Err(err) if err.raw_os_error() == Some(Errno::ENXIO as i32) => {
                        tokio::time::sleep(OPEN_RETRY).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        match tokio::time::timeout(self.open_timeout, open).await {
            Ok(sender) => Ok(Box::new(sender?)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out opening {}", path.display()),
            )),
        }
    }

    /// The read end opens at once; reads wait until the task writes or closes.
    fn open_reader(&self, request: &ExecRequest, stream: &str) -> io::Result<PipeReader> {
        let receiver = pipe::OpenOptions::new().open_receiver(self.fifo_path(&request.id, stream))?;
        Ok(Box::new(receiver))
    }

    fn exit_receiver(&self, id: &str) -> oneshot::Receiver<ExecOutcome> {
        let (tx, rx) = oneshot::channel();
        match self.exits.remove(id) {
            Some((_, ExitSlot::Reported(outcome))) => {
                let _ = tx.send(outcome);
            }
            _ => {
                self.exits.insert(id.to_string(), ExitSlot::Waiting(tx));
            }
        }
        rx
    }
}

#[async_trait]
impl TaskRuntime for FifoRuntime {
    /// Creates the named pipes `request` attaches to. Existing pipes are kept.
    fn prepare(&self, request: &ExecRequest) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        for stream in attached_streams(request) {
            mkfifo(&self.fifo_path(&request.id, stream))?;
        }
        self.exits
            .entry(request.id.clone())
            .or_insert(ExitSlot::Pending);
        Ok(())
    }

    fn release(&self, request: &ExecRequest) {
        self.exits.remove(&request.id);
        if let Err(err) = self.remove(&request.id) {
            warn!(exec_id = %request.id, error = %err, "failed to remove task pipes");
        }
    }

    fn report_exit(&self, id: &str, outcome: ExecOutcome) -> bool {
        self.exit_reporter().report_exit(id, outcome)
    }

    async fn start(
        &self,
        request: &ExecRequest,
        mut resize: mpsc::UnboundedReceiver<TerminalSize>,
    ) -> io::Result<Box<dyn RunningTask>> {
        let stdout = if request.stdout {
            Some(self.open_reader(request, "stdout")?)
        } else {
            None
        };
        let stderr = if request.stderr && !request.tty {
            Some(self.open_reader(request, "stderr")?)
        } else {
            None
        };
        let stdin = if request.stdin {
            Some(self.open_writer(request, "stdin").await?)
        } else {
            None
        };
        debug!(exec_id = %request.id, root = %self.root.display(), "attached to task pipes");

        let exec_id = request.id.clone();
        tokio::spawn(async move {
            while let Some(size) = resize.recv().await {
                trace!(exec_id = %exec_id, rows = size.rows, cols = size.cols, "ignoring resize for piped task");
            }
        });

        Ok(Box::new(FifoTask {
            id: request.id.clone(),
            exit_timeout: self.exit_timeout,
            exit: Some(self.exit_receiver(&request.id)),
            outcome: None,
            pipes: Some(StdioPipes {
                stdin,
                stdout,
                stderr,
            }),
        }))
    }
}

struct FifoTask {
    id: String,
    exit_timeout: Duration,
    exit: Option<oneshot::Receiver<ExecOutcome>>,
    outcome: Option<ExecOutcome>,
    pipes: Option<StdioPipes>,
}

#[async_trait]
impl RunningTask for FifoTask {
    fn take_stdio(&mut self) -> StdioPipes {
        self.pipes.take().unwrap_or_default()
    }

    async fn wait(&mut self) -> ExecOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.exit.take() {
            Some(exit) => match tokio::time::timeout(self.exit_timeout, exit).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) | Err(_) => {
                    debug!(exec_id = %self.id, "no exit reported; assuming success");
                    ExecOutcome::Success
                }
            },
            None => ExecOutcome::Success,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

fn attached_streams(request: &ExecRequest) -> Vec<&'static str> {
    let mut streams = Vec::with_capacity(3);
    if request.stdin {
        streams.push("stdin");
    }
    if request.stdout {
        streams.push("stdout");
    }
    if request.stderr && !request.tty {
        streams.push("stderr");
    }
    streams
}

fn mkfifo(path: &Path) -> io::Result<()> {
    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}
