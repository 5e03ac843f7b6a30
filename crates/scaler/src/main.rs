//! Resource Scaler - database workload right-sizing daemon
//!
//! Learns per-container usage from pushed samples, recommends requests
//! and limits, and carries out compute and storage scale operations one
//! at a time per target.

use anyhow::Result;
use resource_scaler::{api, config::ScalerConfig, executor::StaticExecutor};
use scaler_lib::{
    controller::{channels, ScalingController},
    coordinator::AlwaysReady,
    health::HealthRegistry,
    observability::StructuredLogger,
    store::FileCheckpointStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting resource-scaler");

    let config = ScalerConfig::load()?;
    info!(
        instance = %config.instance_name,
        checkpoint_dir = %config.checkpoint_dir.display(),
        "Scaler configured"
    );

    let health_registry = HealthRegistry::with_scaler_components().await;
    let logger = StructuredLogger::new(&config.instance_name);

    let targets: Vec<_> = config.build_targets()?.into_iter().map(Arc::new).collect();
    let (inputs, streams) = channels(config.channel_capacity);
    let executor = Arc::new(StaticExecutor::new(&targets, inputs.events.clone()));

    let controller = Arc::new(ScalingController::new(
        config.controller_config(),
        Arc::new(FileCheckpointStore::new(&config.checkpoint_dir)),
        Arc::new(AlwaysReady),
        executor,
        health_registry.clone(),
    ));
    for target in targets {
        controller.add_target(target)?;
    }
    logger.log_startup(SCALER_VERSION, controller.targets().len());

    // Readiness flips once persisted histograms are back
    controller.restore_checkpoints().await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let controller_handle = tokio::spawn(controller.clone().run(streams, shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry,
        controller,
        inputs.samples.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    // The controller flushes checkpoints before returning
    let _ = shutdown_tx.send(());
    controller_handle.await?;
    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
