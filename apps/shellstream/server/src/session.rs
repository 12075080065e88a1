use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{future, SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use shellstream_core::{
    run_resize_loop, ChannelId, ChannelSet, ExecOutcome, MuxConnection, ProtocolVariant, Side,
    StatusReporter, WireMessage,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pump::{run_pump, PumpChannels, PumpOptions};
use crate::runtime::{ExecRequest, TaskRuntime};

/// Live exec sessions, for stats and gauges.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

#[derive(Default)]
struct SessionRegistryInner {
    sessions: DashMap<Uuid, SessionEntry>,
    total_sessions: AtomicU64,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    exec_id: String,
    protocol: ProtocolVariant,
    started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub exec_id: String,
    pub protocol: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, exec_id: &str, protocol: ProtocolVariant) -> Uuid {
        let session_id = Uuid::new_v4();
        self.inner.sessions.insert(
            session_id,
            SessionEntry {
                exec_id: exec_id.to_string(),
                protocol,
                started_at: OffsetDateTime::now_utc(),
            },
        );
        self.inner.total_sessions.fetch_add(1, Ordering::Relaxed);
        gauge!("shellstream_sessions_active", self.inner.sessions.len() as f64);
        counter!("shellstream_sessions_total", 1, "protocol" => protocol.metric_label());
        session_id
    }

    fn unregister(&self, session_id: Uuid) {
        self.inner.sessions.remove(&session_id);
        gauge!("shellstream_sessions_active", self.inner.sessions.len() as f64);
    }

    pub fn active(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn total(&self) -> u64 {
        self.inner.total_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session_id: *entry.key(),
                exec_id: entry.exec_id.clone(),
                protocol: entry.protocol.identifier().to_string(),
                started_at: entry.started_at,
            })
            .collect();
        sessions.sort_by_key(|session| session.started_at);
        sessions
    }
}

/// Drives one exec session over an upgraded socket until the task has
/// finished and its status has been written.
pub async fn serve_session(
    socket: WebSocket,
    variant: ProtocolVariant,
    request: ExecRequest,
    runtime: Arc<dyn TaskRuntime>,
    registry: SessionRegistry,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|message: WireMessage| future::ready(Ok::<_, axum::Error>(to_message(message))));
    let stream = stream.filter_map(|message| future::ready(from_message(message)));

    let session_id = registry.register(&request.id, variant);
    let started = Instant::now();
    info!(
        session_id = %session_id,
        exec_id = %request.id,
        protocol = %variant,
        tty = request.tty,
        "exec session started"
    );

    let options = request.stream_options();
    let mut mux = MuxConnection::open(
        sink,
        stream,
        variant,
        Side::Server,
        ChannelSet::for_options(&options),
    );
    let outcome = run_session(&mut mux, &request, Arc::clone(&runtime)).await;
    mux.close().await;
    runtime.release(&request);

    registry.unregister(session_id);
    let elapsed = started.elapsed();
    histogram!(
        "shellstream_session_duration_ms",
        elapsed.as_secs_f64() * 1000.0,
        "protocol" => variant.metric_label()
    );
    match outcome {
        Some(outcome) => {
            counter!("shellstream_exec_exit_total", 1, "outcome" => outcome.metric_label());
            info!(
                session_id = %session_id,
                exec_id = %request.id,
                outcome = %outcome,
                duration_ms = duration_ms(elapsed),
                "exec session closed"
            );
        }
        None => info!(
            session_id = %session_id,
            exec_id = %request.id,
            duration_ms = duration_ms(elapsed),
            "exec session closed before the task ran"
        ),
    }
}

async fn run_session(
    mux: &mut MuxConnection,
    request: &ExecRequest,
    runtime: Arc<dyn TaskRuntime>,
) -> Option<ExecOutcome> {
    let options = request.stream_options();
    if let Err(err) = mux.signal_ready(options.ready_channel()).await {
        warn!(exec_id = %request.id, error = %err, "peer left before streams were ready");
        return None;
    }
    let Some(error_channel) = mux.writer(ChannelId::Error) else {
        warn!(exec_id = %request.id, "error channel unavailable");
        return None;
    };
    let reporter = StatusReporter::new(mux.variant(), error_channel);

    let (resize_tx, resize_rx) = mpsc::unbounded_channel();
    if let Some(reader) = mux.take_reader(ChannelId::Resize) {
        let exec_id = request.id.clone();
        tokio::spawn(async move {
            if let Err(err) = run_resize_loop(reader, resize_tx).await {
                warn!(exec_id = %exec_id, error = %err, "stopped handling resize events");
            }
        });
    }

    let outcome = match runtime.start(request, resize_rx).await {
        Ok(mut task) => {
            let channels = PumpChannels {
                stdin: mux.take_reader(ChannelId::Stdin),
                stdout: mux.writer(ChannelId::Stdout),
                stderr: mux.writer(ChannelId::Stderr),
            };
            let pump_options = PumpOptions {
                stdin_once: request.stdin_once,
                tty: request.tty,
            };
            run_pump(&request.id, channels, task.take_stdio(), pump_options).await;
            task.wait().await
        }
        Err(err) => {
            warn!(exec_id = %request.id, error = %err, "failed to start exec task");
            ExecOutcome::Failed(err.to_string())
        }
    };

    match reporter.report(&outcome).await {
        Ok(_) => debug!(exec_id = %request.id, outcome = %outcome, "status written"),
        Err(err) => debug!(exec_id = %request.id, error = %err, "status not delivered"),
    }
    Some(outcome)
}

fn to_message(message: WireMessage) -> Message {
    match message {
        WireMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Close => Message::Close(None),
    }
}

fn from_message(
    message: Result<Message, axum::Error>,
) -> Option<Result<WireMessage, axum::Error>> {
    match message {
        Ok(Message::Binary(bytes)) => Some(Ok(WireMessage::Binary(bytes.into()))),
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
        Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(err) => Some(Err(err)),
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis().min(u128::from(u64::MAX)) as u64
}
