//! Image pull exporter binary.
//!
//! Loads the fleet file, starts the pull scheduler, and serves the HTTP API
//! until Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pull_exporter::api::{self, AppState};
use pull_exporter::backend;
use pull_exporter::{Config, FleetConfig, Orchestrator, PrometheusMetrics, Scheduler, Trigger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting pull exporter");

    let fleet = FleetConfig::load(&config.fleet_file)?;
    info!(
        fleet_file = %config.fleet_file.display(),
        location = %fleet.location,
        image_count = fleet.image_downloads.len(),
        backend = %fleet.backend_kind,
        interval_minutes = fleet.interval_minutes,
        schedule = fleet.schedule.as_deref().unwrap_or("-"),
        "Configuration loaded"
    );

    let metrics = Arc::new(PrometheusMetrics::new().context("failed to register metrics")?);
    let backend = backend::build(fleet.backend_kind, &config, metrics.clone());
    let trigger = Trigger::from_fleet(&fleet)?;
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(fleet), backend));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(Arc::clone(&orchestrator), trigger);
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    let app = api::create_router(AppState {
        orchestrator,
        metrics,
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "HTTP server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Signal shutdown to the scheduler
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task panicked");
    }

    served.context("HTTP server error")?;
    info!("Pull exporter shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
