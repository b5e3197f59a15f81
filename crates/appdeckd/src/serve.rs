//! `appdeckd serve`: wire the stack together and run the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use appdeck_api::{ApiState, build_router};
use appdeck_core::DaemonConfig;
use appdeck_exec::{CommandBackend, ShellBackend, StepExecutor};
use appdeck_health::HealthMonitor;
use appdeck_lifecycle::Orchestrator;

use crate::admin;

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let state = admin::open_store(&config)?;
    info!(path = %config.db_path().display(), "state store opened");

    let backend: Arc<dyn CommandBackend> = Arc::new(ShellBackend::from_config(&config.executor));
    if config.executor.ssh.is_some() {
        info!("steps run on target nodes over ssh");
    }
    let executor = Arc::new(StepExecutor::with_config(
        backend.clone(),
        state.clone(),
        &config.executor,
    ));
    let sweep_interval = Duration::from_secs(config.health.sweep_interval_secs.max(1));
    let health =
        Arc::new(HealthMonitor::new(state.clone(), backend).with_sweep_interval(sweep_interval));
    let orchestrator = Arc::new(Orchestrator::new(state.clone(), executor, health.clone()));

    let recovered = orchestrator.recover_interrupted()?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "recovered instances interrupted by a previous shutdown");
    }

    if config.health.monitor_on_start {
        for node in state.list_nodes()? {
            health.start_monitor(&node.id).await;
        }
    }

    let api_state = ApiState::new(orchestrator).with_node_monitoring(config.health.monitor_on_start);
    let router = build_router(api_state);

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "admin API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health.stop_all().await;
    info!("appdeckd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
