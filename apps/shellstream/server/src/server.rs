use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use shellstream_core::{
    negotiate, parse_offers, HEADER_PROTOCOL_VERSION, HEADER_WEBSOCKET_PROTOCOL,
};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runtime::{ExecRequest, ExecRequestError, ExitReport, TaskRuntime};
use crate::session::{serve_session, SessionRegistry, SessionSnapshot};
use crate::ticket::{TicketCache, TicketConfig, TicketError};

pub const EXEC_PATH: &str = "/exec";

/// Response body for a registered exec request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecTicket {
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestExecError {
    #[error(transparent)]
    Invalid(#[from] ExecRequestError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error("failed to prepare task stdio: {0}")]
    Prepare(#[from] std::io::Error),
}

/// The exec endpoint: registers requests and serves their sessions.
#[derive(Clone)]
pub struct ExecServer {
    inner: Arc<ExecServerInner>,
}

struct ExecServerInner {
    tickets: TicketCache<ExecRequest>,
    runtime: Arc<dyn TaskRuntime>,
    sessions: SessionRegistry,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    pending_tickets: usize,
    active_sessions: usize,
    total_sessions: u64,
    sessions: Vec<SessionSnapshot>,
}

impl ExecServer {
    pub fn new(tickets: TicketConfig, runtime: Arc<dyn TaskRuntime>) -> Self {
        Self::build(tickets, runtime, None)
    }

    pub fn with_metrics(
        tickets: TicketConfig,
        runtime: Arc<dyn TaskRuntime>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self::build(tickets, runtime, Some(metrics))
    }

    fn build(
        tickets: TicketConfig,
        runtime: Arc<dyn TaskRuntime>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let discard_runtime = Arc::clone(&runtime);
        let tickets = TicketCache::with_discard_hook(tickets, move |request: ExecRequest| {
            debug!(exec_id = %request.id, "exec ticket dropped unused");
            discard_runtime.release(&request);
        });
        Self {
            inner: Arc::new(ExecServerInner {
                tickets,
                runtime,
                sessions: SessionRegistry::new(),
                metrics,
            }),
        }
    }

    /// Registers `request` and returns the single-use URL that serves it.
    ///
    /// A request whose ticket cannot be stored is released again.
    pub fn request_exec(&self, request: ExecRequest) -> Result<ExecTicket, RequestExecError> {
        request.validate()?;
        self.inner.runtime.prepare(&request)?;
        let exec_id = request.id.clone();
        let ttl = self.inner.tickets.config().ttl;
        let ticket = self.inner.tickets.insert(request)?;
        info!(
            exec_id = %exec_id,
            token_prefix = %&ticket.token[..4],
            ttl_secs = ttl.as_secs(),
            "exec ticket issued"
        );
        Ok(ExecTicket {
            url: format!("{EXEC_PATH}/{}", ticket.token),
            expires_at: OffsetDateTime::now_utc() + ttl,
        })
    }

    /// Passes an externally observed task exit to the runtime.
    pub fn report_exit(&self, exec_id: &str, report: ExitReport) -> bool {
        let outcome = report.outcome();
        let accepted = self.inner.runtime.report_exit(exec_id, outcome.clone());
        info!(exec_id, outcome = %outcome, accepted, "task exit reported");
        accepted
    }

    pub fn tickets(&self) -> &TicketCache<ExecRequest> {
        &self.inner.tickets
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.inner.tickets.spawn_sweeper()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(health_handler))
            .route("/debug/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route(EXEC_PATH, post(request_exec_handler))
            .route("/exec/:token", get(exec_handler).post(exec_handler))
            .route("/exec/:token/exit", post(report_exit_handler))
            .with_state(self.clone())
    }

    fn stats(&self) -> StatsResponse {
        let sessions = self.inner.sessions.snapshot();
        StatsResponse {
            pending_tickets: self.inner.tickets.len(),
            active_sessions: sessions.len(),
            total_sessions: self.inner.sessions.total(),
            sessions,
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(server): State<ExecServer>) -> impl IntoResponse {
    Json(server.stats())
}

async fn metrics_handler(State(server): State<ExecServer>) -> Response {
    match &server.inner.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn request_exec_handler(
    State(server): State<ExecServer>,
    Json(request): Json<ExecRequest>,
) -> Response {
    match server.request_exec(request) {
        Ok(ticket) => Json(ticket).into_response(),
        Err(RequestExecError::Ticket(err)) => {
            warn!(error = %err, "rejected exec request");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "reason": err.metric_label(), "message": err.to_string() })),
            )
                .into_response()
        }
        Err(RequestExecError::Prepare(err)) => {
            warn!(error = %err, "failed to prepare exec request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "reason": "prepare_failed", "message": err.to_string() })),
            )
                .into_response()
        }
        Err(RequestExecError::Invalid(err)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "reason": "invalid_request", "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn report_exit_handler(
    State(server): State<ExecServer>,
    Path(exec_id): Path<String>,
    Json(report): Json<ExitReport>,
) -> StatusCode {
    if server.report_exit(&exec_id, report) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn exec_handler(
    State(server): State<ExecServer>,
    Path(token): Path<String>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // The ticket is spent by any request that reaches it.
    let request = match server.inner.tickets.consume(&token) {
        Ok(request) => request,
        Err(err) => {
            info!(reason = err.metric_label(), "exec ticket rejected");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let Some(ws) = ws else {
        counter!("shellstream_upgrades_failed_total", 1, "reason" => "not_upgradable");
        warn!(exec_id = %request.id, "exec request without websocket upgrade");
        server.inner.runtime.release(&request);
        return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
    };

    let offers = parse_offers(
        headers
            .get_all(HEADER_PROTOCOL_VERSION)
            .iter()
            .chain(headers.get_all(HEADER_WEBSOCKET_PROTOCOL).iter())
            .filter_map(|value| value.to_str().ok()),
    );
    let variant = negotiate(&offers);
    info!(
        exec_id = %request.id,
        protocol = %variant,
        offered = ?offers,
        "exec upgrade negotiated"
    );

    let runtime = Arc::clone(&server.inner.runtime);
    let sessions = server.inner.sessions.clone();
    let failed_runtime = Arc::clone(&runtime);
    let failed_request = request.clone();
    let mut response = ws
        .protocols([variant.identifier()])
        .on_failed_upgrade(move |err| {
            counter!("shellstream_upgrades_failed_total", 1, "reason" => "handshake");
            warn!(exec_id = %failed_request.id, error = %err, "exec upgrade failed");
            failed_runtime.release(&failed_request);
        })
        .on_upgrade(move |socket| serve_session(socket, variant, request, runtime, sessions));
    response.headers_mut().insert(
        HeaderName::from_static("x-stream-protocol-version"),
        HeaderValue::from_static(variant.identifier()),
    );
    response
}
