//! The task runtime the exec server attaches sessions to.
//!
//! The server never spawns or owns tasks itself: it asks a [`TaskRuntime`] to
//! start the command described by an [`ExecRequest`], borrows its stdio pipes
//! for the lifetime of the session, and waits for the exit outcome.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shellstream_core::{ExecOutcome, StreamOptions, TerminalSize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(unix)]
mod fifo;
mod process;

#[cfg(unix)]
pub use fifo::{ExitReporter, FifoRuntime};
pub use process::ProcessRuntime;

pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// A pending exec invocation, as registered with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(default = "generate_id")]
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub tty: bool,
    /// Close the task's stdin once the client's stdin ends.
    #[serde(default)]
    pub stdin_once: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecRequestError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("one of stdin, stdout or stderr must be attached")]
    NoStreams,
    #[error("id {0:?} must be a non-empty name without path separators")]
    InvalidId(String),
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: generate_id(),
            command: command.into_iter().map(Into::into).collect(),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            stdin_once: false,
        }
    }

    pub fn validate(&self) -> Result<(), ExecRequestError> {
        if !is_plain_name(&self.id) {
            return Err(ExecRequestError::InvalidId(self.id.clone()));
        }
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ExecRequestError::EmptyCommand);
        }
        if !(self.stdin || self.stdout || self.stderr) {
            return Err(ExecRequestError::NoStreams);
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
        }
    }
}

/// Body of an exit report for a task run outside the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitReport {
    #[serde(default)]
    pub exit_code: i32,
    /// Set when the task could not run at all.
    #[serde(default)]
    pub error: Option<String>,
}

impl ExitReport {
    pub fn outcome(self) -> ExecOutcome {
        match self.error {
            Some(message) => ExecOutcome::Failed(message),
            None => ExecOutcome::from_exit_code(self.exit_code),
        }
    }
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Ids name files under a runtime's root, so they must stay one component.
fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Handles to a running task's standard streams.
///
/// Dropping a handle releases it without affecting the task; dropping the
/// stdin writer is how the session signals end-of-input.
#[derive(Default)]
pub struct StdioPipes {
    pub stdin: Option<PipeWriter>,
    pub stdout: Option<PipeReader>,
    pub stderr: Option<PipeReader>,
}

#[async_trait]
pub trait TaskRuntime: Send + Sync + 'static {
    /// Called when a request is registered, before any client connects.
    fn prepare(&self, _request: &ExecRequest) -> io::Result<()> {
        Ok(())
    }

    /// Undoes [`TaskRuntime::prepare`] once the request can no longer run:
    /// its ticket was dropped unused or its session ended.
    fn release(&self, _request: &ExecRequest) {}

    /// Delivers the exit of a task this runtime does not run itself.
    /// Returns `false` when `id` is unknown or the runtime observes exits
    /// on its own.
    fn report_exit(&self, _id: &str, _outcome: ExecOutcome) -> bool {
        false
    }

    /// Starts `request`; terminal sizes arrive on `resize` for as long as the
    /// session lasts.
    async fn start(
        &self,
        request: &ExecRequest,
        resize: mpsc::UnboundedReceiver<TerminalSize>,
    ) -> io::Result<Box<dyn RunningTask>>;
}

#[async_trait]
pub trait RunningTask: Send {
    /// Hands out the stdio handles; later calls return empty pipes.
    fn take_stdio(&mut self) -> StdioPipes;

    /// Waits for the task to finish.
    async fn wait(&mut self) -> ExecOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn requests_need_a_command_and_a_stream() {
        let request = ExecRequest::new(["echo", "hi"]);
        assert_eq!(request.validate(), Ok(()));

        let empty = ExecRequest::new(Vec::<String>::new());
        assert_eq!(empty.validate(), Err(ExecRequestError::EmptyCommand));

        let mut silent = ExecRequest::new(["true"]);
        silent.stdout = false;
        silent.stderr = false;
        assert_eq!(silent.validate(), Err(ExecRequestError::NoStreams));
    }

    #[test_timeout::timeout]
    fn ids_must_be_a_single_path_component() {
        for bad in ["", ".", "..", "../escaped", "nested/id", "nul\0byte"] {
            let mut request = ExecRequest::new(["true"]);
            request.id = bad.to_string();
            assert_eq!(
                request.validate(),
                Err(ExecRequestError::InvalidId(bad.to_string())),
                "{bad:?}"
            );
        }

        let mut request = ExecRequest::new(["true"]);
        request.id = "job-7.attempt_2".into();
        assert_eq!(request.validate(), Ok(()));
    }

    #[test_timeout::timeout]
    fn exit_reports_map_to_outcomes() {
        let report: ExitReport = serde_json::from_str(r#"{"exit_code":3}"#).expect("json");
        assert_eq!(report.outcome(), ExecOutcome::ExitCode(3));
        let report: ExitReport = serde_json::from_str("{}").expect("json");
        assert_eq!(report.outcome(), ExecOutcome::Success);
        let report: ExitReport =
            serde_json::from_str(r#"{"error":"image missing"}"#).expect("json");
        assert_eq!(report.outcome(), ExecOutcome::Failed("image missing".into()));
    }

    #[test_timeout::timeout]
    fn request_body_defaults() {
        let request: ExecRequest =
            serde_json::from_str(r#"{"command":["sh"],"stdin":true,"tty":true}"#).expect("json");
        assert!(!request.id.is_empty());
        assert!(request.stdin && request.tty);
        assert!(!request.stdout && !request.stdin_once);
        assert!(!request.stream_options().stderr_enabled());
    }
}
