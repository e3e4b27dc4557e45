//! Controller HTTP server

use crate::registry::WorkerRegistry;
use crate::worker_client::WorkerClient;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chatserve_common::metrics::metrics_endpoint;
use chatserve_common::{Result, ServeError};
use chatserve_proto::{
    HeartbeatRequest, HeartbeatResponse, ListModelsResponse, RegisterWorkerRequest, WorkerAddressRequest,
    WorkerAddressResponse, WorkerStatus,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct ControllerState {
    pub registry: Arc<WorkerRegistry>,
    pub workers: WorkerClient,
}

/// Routes served by the controller
pub fn router(state: ControllerState, enable_metrics: bool) -> Router {
    let mut router = Router::new()
        .route("/register_worker", post(register_worker))
        .route("/receive_heart_beat", post(receive_heart_beat))
        .route("/list_models", post(list_models))
        .route("/get_worker_address", post(get_worker_address))
        .route("/refresh_all_workers", post(refresh_all_workers))
        .route("/worker_get_status", post(worker_get_status));
    if enable_metrics {
        router = router.route("/metrics", get(metrics_endpoint));
    }
    router.with_state(state)
}

/// Registers a worker, asking it for its status when none was sent
async fn register_worker(
    State(state): State<ControllerState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> std::result::Result<StatusCode, ServeError> {
    let status = match request.worker_status {
        Some(status) => status,
        None => state.workers.get_status(&request.worker_name).await?,
    };
    state
        .registry
        .register(&request.worker_name, request.check_heart_beat, status);
    Ok(StatusCode::OK)
}

async fn receive_heart_beat(
    State(state): State<ControllerState>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let exists = state.registry.heartbeat(&request.worker_name, request.queue_length);
    Json(HeartbeatResponse { exists })
}

async fn list_models(State(state): State<ControllerState>) -> Json<ListModelsResponse> {
    Json(ListModelsResponse {
        models: state.registry.list_models(),
    })
}

async fn get_worker_address(
    State(state): State<ControllerState>,
    Json(request): Json<WorkerAddressRequest>,
) -> Json<WorkerAddressResponse> {
    let address = state.registry.get_worker_address(&request.model).unwrap_or_default();
    Json(WorkerAddressResponse { address })
}

async fn refresh_all_workers(State(state): State<ControllerState>) -> StatusCode {
    state.registry.refresh_all(&state.workers).await;
    StatusCode::OK
}

async fn worker_get_status(State(state): State<ControllerState>) -> Json<WorkerStatus> {
    Json(state.registry.aggregate_status())
}

/// Controller HTTP server
pub struct ControllerServer {
    state: ControllerState,
    bind_address: String,
    port: u16,
    enable_metrics: bool,
}

impl ControllerServer {
    pub fn new(state: ControllerState, bind_address: String, port: u16) -> Self {
        Self {
            state,
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
        info!("Controller HTTP server listening on {}", listener.local_addr()?);

        axum::serve(listener, router(self.state, self.enable_metrics))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Controller HTTP server stopped");
        Ok(())
    }
}
