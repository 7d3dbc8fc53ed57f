//! Swap Forwarder - cross-rail atomic swap forwarding daemon
//!
//! Accepts quotes, holds the inbound leg of each trade on one payment rail,
//! pays the counterparty under the same hash on the other rail, and settles
//! the inbound leg with the preimage that payment reveals.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

mod api;
mod config;
mod coordination;
mod counterparty;
mod engine;
mod error;
mod events;
mod metrics;
mod retry;
mod state;
mod timelock;
mod types;

use config::Settings;
use coordination::TradeOrchestrator;
use counterparty::HttpCounterparty;
use engine::EngineSet;
use events::TradeEvents;
use metrics::MetricsServer;
use state::{StateManager, TradeStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Forwarder v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Loaded configuration for {} engines", settings.engines.len());

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;

    let store: Arc<dyn TradeStore> = state_manager.clone();

    // Initialize rail engines
    let engines = Arc::new(EngineSet::from_settings(&settings)?);
    for engine in engines.all() {
        info!("Engine {} ({}) configured", engine.asset(), engine.kind());
    }

    let counterparty = Arc::new(HttpCounterparty::new(&settings.counterparty)?);
    let events = TradeEvents::new();

    let orchestrator = Arc::new(TradeOrchestrator::new(
        store.clone(),
        counterparty,
        engines.clone(),
        events.clone(),
        settings.forwarder.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            store: store.clone(),
            orchestrator: orchestrator.clone(),
            engines: engines.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Keep engine validation fresh
    let validation_handle = tokio::spawn({
        let engines = engines.clone();
        let interval = Duration::from_secs(settings.forwarder.validation_interval_secs);
        async move { engines.run_validation(interval).await }
    });

    // Log trade updates
    let updates_handle = tokio::spawn({
        let mut updates = events.subscribe();
        async move {
            loop {
                match updates.recv().await {
                    Ok(update) => debug!(trade_id = %update.id, "{}", update.name()),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Trade update log lagged, skipped {} updates", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    // Replay trades left pending by a previous run
    let replay_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            match orchestrator.replay_pending_trades().await {
                Ok(Some(summary)) => info!(
                    "Replayed {} trade(s): {} completed, {} failed",
                    summary.replayed, summary.completed, summary.failed
                ),
                Ok(None) => {}
                Err(e) => error!("Trade replay error: {}", e),
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.forwarder.readiness_poll();
        async move {
            loop {
                tokio::time::sleep(interval).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Swap Forwarder is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks; unfinished trades are replayed on next start
    api_handle.abort();
    validation_handle.abort();
    updates_handle.abort();
    replay_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Forwarder stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,swap_forwarder=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
