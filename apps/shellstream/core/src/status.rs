//! The final status record written on the error channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::mux::{ChannelWriter, MuxError};
use crate::protocol::ProtocolVariant;

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILURE: &str = "Failure";
pub const REASON_NON_ZERO_EXIT: &str = "NonZeroExitCode";
pub const REASON_INTERNAL_ERROR: &str = "InternalError";
pub const CAUSE_EXIT_CODE: &str = "ExitCode";

/// How a command invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    /// The process ran and exited with a non-zero code.
    ExitCode(i32),
    /// Execution failed for any other reason.
    Failed(String),
}

impl ExecOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            ExecOutcome::Success
        } else {
            ExecOutcome::ExitCode(code)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success)
    }

    /// Process exit code a local caller should use for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecOutcome::Success => 0,
            ExecOutcome::ExitCode(code) => *code,
            ExecOutcome::Failed(_) => 1,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            ExecOutcome::Success => "success",
            ExecOutcome::ExitCode(_) => "non_zero_exit",
            ExecOutcome::Failed(_) => "internal_error",
        }
    }

    pub fn to_status(&self) -> Status {
        match self {
            ExecOutcome::Success => Status::success(),
            ExecOutcome::ExitCode(code) => Status {
                status: STATUS_FAILURE.to_string(),
                message: Some(format!(
                    "command terminated with non-zero exit code: exit status {code}"
                )),
                reason: Some(REASON_NON_ZERO_EXIT.to_string()),
                details: Some(StatusDetails {
                    causes: vec![StatusCause {
                        kind: Some(CAUSE_EXIT_CODE.to_string()),
                        message: Some(code.to_string()),
                    }],
                }),
                ..Status::default()
            },
            ExecOutcome::Failed(message) => {
                let message = format!("error executing command: {message}");
                Status {
                    status: STATUS_FAILURE.to_string(),
                    message: Some(format!("Internal error occurred: {message}")),
                    reason: Some(REASON_INTERNAL_ERROR.to_string()),
                    code: Some(500),
                    details: Some(StatusDetails {
                        causes: vec![StatusCause {
                            kind: None,
                            message: Some(message),
                        }],
                    }),
                    ..Status::default()
                }
            }
        }
    }

    /// Interprets a structured status record.
    pub fn from_status(status: &Status) -> Self {
        if status.status == STATUS_SUCCESS {
            return ExecOutcome::Success;
        }
        if status.reason.as_deref() == Some(REASON_NON_ZERO_EXIT) {
            let code = status
                .details
                .iter()
                .flat_map(|details| details.causes.iter())
                .filter(|cause| cause.kind.as_deref() == Some(CAUSE_EXIT_CODE))
                .find_map(|cause| cause.message.as_deref()?.trim().parse::<i32>().ok());
            if let Some(code) = code {
                return ExecOutcome::from_exit_code(code);
            }
        }
        ExecOutcome::Failed(
            status
                .message
                .clone()
                .unwrap_or_else(|| status.status.clone()),
        )
    }
}

impl fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecOutcome::Success => f.write_str("success"),
            ExecOutcome::ExitCode(code) => write!(f, "exit code {code}"),
            ExecOutcome::Failed(message) => f.write_str(message),
        }
    }
}

/// JSON status record compatible with `metav1.Status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub metadata: StatusMetadata,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl Status {
    pub fn success() -> Self {
        Status {
            status: STATUS_SUCCESS.to_string(),
            ..Status::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMetadata {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(rename = "reason", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum StatusDecodeError {
    #[error("malformed status record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bytes to put on the error channel for `outcome`; `None` means write nothing.
pub fn encode_status(variant: ProtocolVariant, outcome: &ExecOutcome) -> Option<Vec<u8>> {
    if variant.is_v4() {
        // Serializing a plain struct of strings cannot fail.
        serde_json::to_vec(&outcome.to_status()).ok()
    } else {
        match outcome.to_status() {
            status if status.status == STATUS_SUCCESS => None,
            status => Some(status.message.unwrap_or_default().into_bytes()),
        }
    }
}

/// Reads everything received on the error channel back into an outcome.
pub fn decode_status(variant: ProtocolVariant, data: &[u8]) -> Result<ExecOutcome, StatusDecodeError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(ExecOutcome::Success);
    }
    if variant.is_v4() {
        let status: Status = serde_json::from_slice(data)?;
        Ok(ExecOutcome::from_status(&status))
    } else {
        let message = String::from_utf8_lossy(data).trim().to_string();
        Ok(ExecOutcome::Failed(message))
    }
}

/// Writes the status record at most once, then closes the error channel.
#[derive(Debug)]
pub struct StatusReporter {
    variant: ProtocolVariant,
    channel: ChannelWriter,
    written: AtomicBool,
}

impl StatusReporter {
    pub fn new(variant: ProtocolVariant, channel: ChannelWriter) -> Self {
        Self {
            variant,
            channel,
            written: AtomicBool::new(false),
        }
    }

    /// Returns `Ok(false)` if a status was already reported.
    pub async fn report(&self, outcome: &ExecOutcome) -> Result<bool, MuxError> {
        if self.written.swap(true, Ordering::SeqCst) {
            debug!(outcome = %outcome, "status already reported");
            return Ok(false);
        }
        let result = match encode_status(self.variant, outcome) {
            Some(record) => self.channel.write(Bytes::from(record)).await,
            None => Ok(()),
        };
        self.channel.close();
        result.map(|()| true)
    }
}
