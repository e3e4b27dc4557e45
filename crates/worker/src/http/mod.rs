//! HTTP server and controller client for the worker

pub mod client;
pub mod server;

pub use client::HttpControllerClient;
pub use server::{router, WorkerServer};
