//! Common error types for ChatServe
//!
//! This module defines all error types used across the ChatServe system.
//! All errors are convertible to HTTP status codes so that handlers can
//! return them directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for ChatServe
#[derive(Error, Debug)]
pub enum ServeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client errors (controller or worker calls)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Inference engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Engine ran out of memory or cache capacity
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Tokenizer errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Controller rejected or mishandled a call
    #[error("Controller error: {0}")]
    Controller(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Worker unavailable
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AddrParseError> for ServeError {
    fn from(err: AddrParseError) -> Self {
        ServeError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for ServeError {
    fn from(err: config::ConfigError) -> Self {
        ServeError::Config(err.to_string())
    }
}

impl ServeError {
    /// Convert error to an HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeError::Http(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ServeError::Http(_) => StatusCode::BAD_GATEWAY,
            ServeError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServeError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServeError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Tokenizer(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServeError::Controller(_) => StatusCode::BAD_GATEWAY,
            ServeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServeError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServeError::Parse(_) => StatusCode::BAD_REQUEST,
            ServeError::Serialization(_) => StatusCode::BAD_REQUEST,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::Config(_) => "config_error",
            ServeError::Http(_) => "http_error",
            ServeError::Connection(_) => "connection_error",
            ServeError::Engine(_) => "engine_error",
            ServeError::ResourceExhausted(_) => "resource_exhausted",
            ServeError::Tokenizer(_) => "tokenizer_error",
            ServeError::Serialization(_) => "serialization_error",
            ServeError::Io(_) => "io_error",
            ServeError::InvalidInput(_) => "invalid_request",
            ServeError::Controller(_) => "controller_error",
            ServeError::Timeout(_) => "timeout",
            ServeError::WorkerUnavailable(_) => "worker_unavailable",
            ServeError::Parse(_) => "parse_error",
            ServeError::Internal(_) => "internal_error",
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ServeError::Config(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        ServeError::Engine(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        ServeError::ResourceExhausted(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        ServeError::Tokenizer(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServeError::InvalidInput(msg.into())
    }

    /// Create a controller error
    pub fn controller(msg: impl Into<String>) -> Self {
        ServeError::Controller(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ServeError::Timeout(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        ServeError::WorkerUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ServeError::Internal(msg.into())
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type alias for ChatServe operations
pub type Result<T> = std::result::Result<T, ServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_maps_to_bad_request() {
        let err = ServeError::invalid_input("temperature must be >= 0");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "invalid_request");
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_into_response_carries_status() {
        let response = ServeError::worker_unavailable("no worker for opt-1.3b").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_addr_parse_error_conversion() {
        let err: ServeError = "not-an-address"
            .parse::<std::net::SocketAddr>()
            .unwrap_err()
            .into();
        assert!(matches!(err, ServeError::Parse(_)));
    }
}
