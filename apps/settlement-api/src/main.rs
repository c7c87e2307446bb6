//! # FleetPay Settlement API
//!
//! Webhook server plus the background settlement worker.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Settlement API Server                            │
//! │                                                                         │
//! │  Processor ───► HTTP (8080) ───► WebhookReconciler ───► SQLite         │
//! │                                                          ▲              │
//! │                 SettlementWorker (retry + reconcile) ────┘              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `settlement-api [path/to/fleetpay.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetpay_db::Database;
use fleetpay_engine::{
    ConnectManager, EngineConfig, HttpProcessorClient, ProcessorGateway, RetryPolicy,
    RetryingGateway, SettlementService, SettlementWorker, WebhookReconciler,
};
use settlement_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fleetpay=debug")),
        )
        .with_target(true)
        .init();

    info!("Starting FleetPay settlement API...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path).context("loading configuration")?;

    let db = Database::new(config.db_config())
        .await
        .context("opening database")?;
    info!(path = ?config.database.path, "Database ready");

    let http = HttpProcessorClient::new(&config.processor).context("building processor client")?;
    let gateway: Arc<dyn ProcessorGateway> = Arc::new(RetryingGateway::new(
        Arc::new(http),
        RetryPolicy::from(&config.processor),
    ));

    let settlement = SettlementService::new(db.clone(), gateway.clone(), &config.settlement);
    let connect = ConnectManager::new(db.clone(), gateway);
    let reconciler = WebhookReconciler::new(
        db.clone(),
        connect,
        &config.webhook,
        &config.settlement,
    );

    let (worker, worker_handle) = SettlementWorker::new(
        settlement,
        reconciler.clone(),
        Duration::from_secs(config.settlement.reconcile_interval_secs),
        config.webhook.retention_days,
    );
    let worker_task = tokio::spawn(worker.run());

    let state = AppState::new(
        db.clone(),
        reconciler,
        config.webhook.clone(),
        config.server.admin_token.clone(),
    );
    if state.admin_token.is_none() {
        info!("No admin token configured; operator routes disabled");
    }

    let addr = config.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "Settlement API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("HTTP server stopped, stopping worker");
    if let Err(e) = worker_handle.shutdown().await {
        error!(error = %e, "Worker shutdown failed");
    }
    if let Err(e) = worker_task.await {
        error!(error = %e, "Worker task panicked");
    }

    db.close().await;
    info!("Settlement API shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
