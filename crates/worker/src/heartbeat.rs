//! Controller registration and heartbeats
//!
//! The reporter is a two-state machine. While `Unknown` it registers,
//! retrying until the controller answers. While `Registered` it waits one
//! interval and sends the current queue length. A heartbeat answered with
//! `exists: false` drops it back to `Unknown`, so the very next controller
//! call is a registration. Network failures are retried forever.

use crate::gate::ConcurrencyGate;
use crate::service::WorkerIdentity;
use async_trait::async_trait;
use chatserve_common::{Result, METRICS};
use chatserve_proto::{HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The controller calls a worker makes
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn register_worker(&self, request: &RegisterWorkerRequest) -> Result<()>;

    async fn send_heart_beat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse>;
}

#[async_trait]
impl<T: ControllerClient + ?Sized> ControllerClient for Arc<T> {
    async fn register_worker(&self, request: &RegisterWorkerRequest) -> Result<()> {
        (**self).register_worker(request).await
    }

    async fn send_heart_beat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        (**self).send_heart_beat(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Unknown,
}

pub struct HeartbeatReporter<C> {
    client: C,
    identity: Arc<WorkerIdentity>,
    gate: ConcurrencyGate,
    interval: Duration,
    retry: Duration,
    state: RegistrationState,
}

impl<C: ControllerClient> HeartbeatReporter<C> {
    pub fn new(
        client: C,
        identity: Arc<WorkerIdentity>,
        gate: ConcurrencyGate,
        interval: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            client,
            identity,
            gate,
            interval,
            retry,
            state: RegistrationState::Unknown,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Register with the controller, retrying until it succeeds
    pub async fn register(&mut self) {
        loop {
            let request = RegisterWorkerRequest {
                worker_name: self.identity.worker_address.clone(),
                check_heart_beat: true,
                worker_status: Some(self.identity.status(self.gate.load_snapshot())),
            };

            match self.client.register_worker(&request).await {
                Ok(()) => {
                    METRICS.worker.registrations.inc();
                    info!(
                        "Registered worker {} ({}) for model {}",
                        self.identity.worker_id, self.identity.worker_address, self.identity.model_name
                    );
                    self.state = RegistrationState::Registered;
                    return;
                }
                Err(e) => {
                    METRICS.worker.heartbeat_failures.inc();
                    warn!("Registration failed: {}, retrying in {:?}", e, self.retry);
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
    }

    /// Send one heartbeat, retrying until the controller answers.
    /// Returns whether the controller still knows this worker.
    async fn heart_beat(&mut self) -> bool {
        loop {
            let request = HeartbeatRequest {
                worker_name: self.identity.worker_address.clone(),
                queue_length: self.gate.queue_length(),
            };

            match self.client.send_heart_beat(&request).await {
                Ok(response) => {
                    METRICS.worker.heartbeats_sent.inc();
                    debug!("Heartbeat sent, queue_length={}", request.queue_length);
                    return response.exists;
                }
                Err(e) => {
                    METRICS.worker.heartbeat_failures.inc();
                    warn!("Heartbeat failed: {}, retrying in {:?}", e, self.retry);
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
    }

    /// Advance the state machine by one controller exchange
    pub async fn step(&mut self) {
        match self.state {
            RegistrationState::Unknown => self.register().await,
            RegistrationState::Registered => {
                tokio::time::sleep(self.interval).await;
                if !self.heart_beat().await {
                    warn!("Controller forgot worker {}, registering again", self.identity.worker_id);
                    self.state = RegistrationState::Unknown;
                }
            }
        }
    }

    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }
}

impl<C: ControllerClient + 'static> HeartbeatReporter<C> {
    /// Run the reporter as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
