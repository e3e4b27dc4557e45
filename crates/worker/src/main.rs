//! ChatServe Worker - Main Entry Point
//!
//! Loads configuration, builds the demo engine and the generation service,
//! starts the controller heartbeat and serves HTTP until ctrl-c.

use anyhow::Context;
use chatserve_common::ServeConfig;
use chatserve_worker::{
    ByteTokenizer, DemoEngine, HeartbeatReporter, HttpControllerClient, WorkerIdentity, WorkerServer,
    WorkerService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("CHATSERVE_CONFIG").ok().map(PathBuf::from);
    let config = ServeConfig::load("worker", config_path.as_deref()).context("loading worker configuration")?;

    // Initialize logging
    let default_filter = config
        .observability
        .as_ref()
        .map(|o| o.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatserve_worker={0},chatserve_common={0},transcript={0}", default_filter).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChatServe Worker");

    let worker_config = config.worker_config()?.clone();
    info!(
        "Worker configuration loaded: bind={}, controller={}, model={}",
        config.listen_address(),
        worker_config.controller_address,
        worker_config.model_name
    );

    let identity = WorkerIdentity::generate(&worker_config.worker_address, &worker_config.model_name);
    let engine = Arc::new(DemoEngine::new(
        worker_config.context_len,
        worker_config.engine.max_cached_sequences,
    ));
    let service = Arc::new(WorkerService::new(
        identity,
        engine,
        Arc::new(ByteTokenizer),
        &worker_config,
    )?);

    // Start heartbeats
    let reporter = if worker_config.no_register {
        warn!("Controller registration disabled");
        None
    } else {
        let client = HttpControllerClient::new(
            worker_config.controller_address.clone(),
            worker_config.controller_timeout(),
        )?;
        let reporter = HeartbeatReporter::new(
            client,
            Arc::clone(service.identity()),
            service.gate().clone(),
            worker_config.heart_beat_interval(),
            worker_config.heart_beat_retry(),
        );
        Some(reporter.spawn())
    };

    let server = WorkerServer::new(service, config.bind_address.clone(), config.port)
        .with_metrics(config.metrics_enabled());
    server
        .serve(async {
            if signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;

    if let Some(handle) = reporter {
        handle.abort();
    }

    info!("ChatServe Worker shutdown complete");
    Ok(())
}
