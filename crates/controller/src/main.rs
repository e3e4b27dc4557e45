//! ChatServe Controller - Main Entry Point
//!
//! Keeps track of workers and hands out worker addresses per model.

use anyhow::Context;
use chatserve_common::ServeConfig;
use chatserve_controller::{ControllerServer, ControllerState, WorkerClient, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("CHATSERVE_CONFIG").ok().map(PathBuf::from);
    let config =
        ServeConfig::load("controller", config_path.as_deref()).context("loading controller configuration")?;

    // Initialize logging
    let default_filter = config
        .observability
        .as_ref()
        .map(|o| o.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatserve_controller={0},chatserve_common={0}", default_filter).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChatServe Controller");

    let controller_config = config.controller_config()?;
    info!(
        "Controller configuration loaded: bind={}, dispatch={:?}, expiration={}s",
        config.listen_address(),
        controller_config.dispatch,
        controller_config.heart_beat_expiration_secs
    );

    let registry = Arc::new(WorkerRegistry::new(controller_config));
    let expiry_handle = Arc::clone(&registry).start_expiry_checks();

    let state = ControllerState {
        registry,
        workers: WorkerClient::new(controller_config.worker_timeout())?,
    };

    ControllerServer::new(state, config.bind_address.clone(), config.port)
        .with_metrics(config.metrics_enabled())
        .serve(async {
            if signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;

    expiry_handle.abort();

    info!("ChatServe Controller shutdown complete");
    Ok(())
}
