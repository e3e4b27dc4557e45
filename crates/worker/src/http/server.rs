//! Worker HTTP server

use crate::service::WorkerService;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatserve_common::metrics::metrics_endpoint;
use chatserve_common::{Result, ServeError};
use chatserve_proto::{GenerateStreamParams, WorkerStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::info;

/// Routes served by a worker
pub fn router(service: Arc<WorkerService>, enable_metrics: bool) -> Router {
    let mut router = Router::new()
        .route("/worker_generate_stream", post(generate_stream))
        .route("/worker_get_status", post(get_status));
    if enable_metrics {
        router = router.route("/metrics", get(metrics_endpoint));
    }
    router.with_state(service)
}

/// Streams NUL-delimited JSON frames until the session ends
async fn generate_stream(
    State(service): State<Arc<WorkerService>>,
    Json(params): Json<GenerateStreamParams>,
) -> std::result::Result<Response, ServeError> {
    let frames = service.generate_stream(params).await?;
    let body = Body::from_stream(frames.map(|frame| frame.encode()));

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

async fn get_status(State(service): State<Arc<WorkerService>>) -> Json<WorkerStatus> {
    Json(service.get_status())
}

/// Worker HTTP server
pub struct WorkerServer {
    service: Arc<WorkerService>,
    bind_address: String,
    port: u16,
    enable_metrics: bool,
}

impl WorkerServer {
    pub fn new(service: Arc<WorkerService>, bind_address: String, port: u16) -> Self {
        Self {
            service,
            bind_address,
            port,
            enable_metrics: true,
        }
    }

    pub fn with_metrics(mut self, enable_metrics: bool) -> Self {
        self.enable_metrics = enable_metrics;
        self
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((self.bind_address.as_str(), self.port)).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Worker HTTP server listening on {}", listener.local_addr()?);

        axum::serve(listener, router(self.service, self.enable_metrics))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Worker HTTP server stopped");
        Ok(())
    }
}
