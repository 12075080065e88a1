use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use shellstream_server::{
    runtime::TaskRuntime, telemetry::Telemetry, Cli, ExecServer, ProcessRuntime, ServerConfig,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        ticket_ttl_secs = config.tickets.ttl.as_secs(),
        max_tickets = config.tickets.capacity,
        fifo_root = ?config.fifo_root,
        "starting shellstream server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let runtime = task_runtime(&config)?;
    let server = ExecServer::with_metrics(config.tickets.clone(), runtime, metrics);
    let sweeper_handle = server.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("shellstream listening on {}", config.listen_addr);

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

#[cfg(unix)]
fn task_runtime(config: &ServerConfig) -> Result<Arc<dyn TaskRuntime>> {
    use shellstream_server::runtime::FifoRuntime;

    Ok(match &config.fifo_root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("failed to create fifo root {}", root.display()))?;
            Arc::new(FifoRuntime::new(root))
        }
        None => Arc::new(ProcessRuntime::new()),
    })
}

#[cfg(not(unix))]
fn task_runtime(config: &ServerConfig) -> Result<Arc<dyn TaskRuntime>> {
    anyhow::ensure!(
        config.fifo_root.is_none(),
        "fifo attachment is only supported on unix"
    );
    Ok(Arc::new(ProcessRuntime::new()))
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
