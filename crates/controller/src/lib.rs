//! ChatServe Controller
//!
//! Registry of live workers. Workers register and send heartbeats; clients
//! ask which worker serves a model. Workers that stop sending heartbeats are
//! dropped.

pub mod registry;
pub mod server;
pub mod worker_client;

pub use registry::{WorkerInfo, WorkerRegistry};
pub use server::{router, ControllerServer, ControllerState};
pub use worker_client::WorkerClient;
