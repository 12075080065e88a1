//! Copies bytes between a task's stdio pipes and a session's channels.
//!
//! One copy task runs per attached direction. When an output direction
//! finishes it closes its channel and stops stdin; when stdin finishes it
//! either closes the task's stdin (`stdin_once` without a terminal) or, when
//! the client ended it, stops the output directions. [`run_pump`] returns once
//! every direction is done.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use shellstream_core::{ChannelId, ChannelReader, ChannelWriter, CloseSignal};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::runtime::{PipeReader, PipeWriter, StdioPipes};

const COPY_BUFFER: usize = 32 * 1024;

/// Session channels the pump is wired to. `None` means not attached.
#[derive(Debug, Default)]
pub struct PumpChannels {
    pub stdin: Option<ChannelReader>,
    pub stdout: Option<ChannelWriter>,
    pub stderr: Option<ChannelWriter>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PumpOptions {
    pub stdin_once: bool,
    pub tty: bool,
}

/// Bytes moved per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub stdin: u64,
    pub stdout: u64,
    pub stderr: u64,
}

enum Finished {
    Stdin(u64, Option<PipeWriter>),
    Output(ChannelId, u64),
}

/// Runs every copy direction to completion.
///
/// A failure in one direction ends only that direction; the closure cascade
/// still unblocks the others.
pub async fn run_pump(
    exec_id: &str,
    channels: PumpChannels,
    pipes: StdioPipes,
    options: PumpOptions,
) -> PumpReport {
    let stop_stdout = Arc::new(CloseSignal::new());
    let stop_stderr = Arc::new(CloseSignal::new());
    let stdin_closer = channels.stdin.as_ref().map(ChannelReader::closer);
    let output_finished = Arc::new(CloseSignal::new());
    let mut tasks = JoinSet::new();

    match (channels.stdin, pipes.stdin) {
        (Some(reader), Some(pipe)) => {
            let stop_outputs = [Arc::clone(&stop_stdout), Arc::clone(&stop_stderr)];
            let output_finished = Arc::clone(&output_finished);
            tasks.spawn(async move {
                let (copied, pipe) =
                    copy_stdin(reader, pipe, options, &stop_outputs, &output_finished).await;
                Finished::Stdin(copied, pipe)
            });
        }
        (Some(_), None) => debug!(exec_id, "task has no stdin pipe; ignoring client stdin"),
        _ => {}
    }

    let outputs = [
        (ChannelId::Stdout, channels.stdout, pipes.stdout, stop_stdout),
        (ChannelId::Stderr, channels.stderr, pipes.stderr, stop_stderr),
    ];
    for (channel, writer, pipe, stop) in outputs {
        let (Some(writer), Some(pipe)) = (writer, pipe) else {
            continue;
        };
        let stdin_closer = stdin_closer.clone();
        let output_finished = Arc::clone(&output_finished);
        tasks.spawn(async move {
            let copied = copy_output(channel, pipe, &writer, &stop).await;
            writer.close();
            output_finished.close();
            if let Some(closer) = stdin_closer {
                closer.close();
            }
            Finished::Output(channel, copied)
        });
    }

    let mut report = PumpReport::default();
    let mut held_stdin = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Finished::Stdin(copied, pipe)) => {
                report.stdin = copied;
                held_stdin = pipe;
            }
            Ok(Finished::Output(ChannelId::Stderr, copied)) => report.stderr = copied,
            Ok(Finished::Output(_, copied)) => report.stdout = copied,
            Err(err) => warn!(exec_id, error = %err, "copy task failed"),
        }
    }
    drop(held_stdin);

    for (channel, bytes) in [
        (ChannelId::Stdin, report.stdin),
        (ChannelId::Stdout, report.stdout),
        (ChannelId::Stderr, report.stderr),
    ] {
        if bytes > 0 {
            counter!("shellstream_bytes_total", bytes, "channel" => channel.as_str());
        }
    }
    info!(
        exec_id,
        stdin_bytes = report.stdin,
        stdout_bytes = report.stdout,
        stderr_bytes = report.stderr,
        "exec streams finished"
    );
    report
}

/// Returns the task's stdin pipe when it must stay open until the pump ends.
///
/// Outputs are only stopped when the client ended stdin; a reader closed
/// because an output already finished leaves the other output draining.
async fn copy_stdin(
    mut reader: ChannelReader,
    mut pipe: PipeWriter,
    options: PumpOptions,
    stop_outputs: &[Arc<CloseSignal>],
    output_finished: &CloseSignal,
) -> (u64, Option<PipeWriter>) {
    let mut copied = 0u64;
    while let Some(chunk) = reader.recv().await {
        if let Err(err) = write_chunk(&mut pipe, &chunk).await {
            warn!(error = %err, "failed to redirect stdin");
            break;
        }
        copied += chunk.len() as u64;
    }
    debug!(copied, "stdin closed");

    if options.stdin_once && !options.tty {
        if let Err(err) = pipe.shutdown().await {
            debug!(error = %err, "failed to close task stdin");
        }
        (copied, None)
    } else {
        if output_finished.is_closed() {
            return (copied, Some(pipe));
        }
        for stop in stop_outputs {
            stop.close();
        }
        (copied, Some(pipe))
    }
}

async fn write_chunk(pipe: &mut PipeWriter, chunk: &[u8]) -> io::Result<()> {
    pipe.write_all(chunk).await?;
    pipe.flush().await
}

async fn copy_output(
    channel: ChannelId,
    mut pipe: PipeReader,
    writer: &ChannelWriter,
    stop: &CloseSignal,
) -> u64 {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut copied = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.closed() => break,
            _ = writer.disconnected() => break,
            read = pipe.read(&mut buf) => read,
        };
        let read = match read {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(channel = %channel, error = %err, "failed to read task output");
                break;
            }
        };
        if let Err(err) = writer.write(Bytes::copy_from_slice(&buf[..read])).await {
            debug!(channel = %channel, error = %err, "output channel closed");
            break;
        }
        copied += read as u64;
    }
    debug!(channel = %channel, copied, "finished piping output");
    copied
}
