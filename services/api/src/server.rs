use crate::cli::ServeArgs;
use crate::infra::{build_workflow, retry_policy, AppState};
use crate::routes::with_workflow_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use majusurat::config::AppConfig;
use majusurat::error::AppError;
use majusurat::telemetry;
use majusurat::workflows::submissions::{
    spawn_reconciliation_worker, spawn_retry_worker, InMemoryAuditLedger, LocalUploadStore,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    std::fs::create_dir_all(&config.uploads.directory)?;
    let stack = build_workflow(
        retry_policy(&config),
        &config.bootstrap_admin,
        Vec::new(),
        Arc::new(InMemoryAuditLedger::default()),
        Arc::new(LocalUploadStore::new(config.uploads.directory.clone())),
    );

    let retry_worker = spawn_retry_worker(
        stack.queue.clone(),
        stack.ledger.clone(),
        config.ledger_retry.tick,
    );
    let reconciliation_worker = config.reconciliation.interval.map(|every| {
        spawn_reconciliation_worker(stack.services.coordinator.clone(), every)
    });

    let app = with_workflow_routes(stack.services.clone())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        bootstrap_admin = %config.bootstrap_admin,
        retry_capacity = config.ledger_retry.capacity,
        "letter request service ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    readiness_flag.store(false, Ordering::Release);
    retry_worker.abort();
    if let Some(worker) = reconciliation_worker {
        worker.abort();
    }

    // Last chance for queued ledger writes before the in-process queue disappears.
    let report = stack.queue.flush(stack.ledger.as_ref());
    if stack.queue.is_empty() {
        info!(?report, "ledger retry queue drained on shutdown");
    } else {
        warn!(
            remaining = stack.queue.len(),
            ?report,
            "ledger writes still pending at shutdown; the next reconciliation pass must repair them"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
