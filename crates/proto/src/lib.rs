//! ChatServe wire protocol
//!
//! JSON bodies exchanged between clients, workers and the controller, plus
//! the NUL-delimited frame codec used by `/worker_generate_stream`.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Byte that terminates every streamed frame
pub const FRAME_DELIMITER: u8 = b'\0';

/// Text sent in place of output when generation fails
pub const SERVER_ERROR_MSG: &str =
    "**NETWORK ERROR DUE TO HIGH TRAFFIC. PLEASE REGENERATE OR REFRESH THIS PAGE.**";

fn default_temperature() -> f32 {
    1.0
}

fn default_max_new_tokens() -> i64 {
    256
}

// Worker generation types

/// Body of `POST /worker_generate_stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateStreamParams {
    /// Model the client expects; empty means "whatever this worker serves"
    #[serde(default)]
    pub model: String,

    pub prompt: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: i64,

    /// Stop sequence; generation ends at its first occurrence
    #[serde(default)]
    pub stop: Option<String>,

    /// Per-request sampling seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerateStreamParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: String::new(),
            prompt: prompt.into(),
            temperature: default_temperature(),
            max_new_tokens: default_max_new_tokens(),
            stop: None,
            seed: None,
        }
    }
}

/// Error code carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    /// Engine ran out of memory; the frame is terminal
    ResourceExhausted = 1,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code as i32
    }
}

/// One streamed unit of partial output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub text: String,
    pub error_code: i32,
}

impl StreamFrame {
    /// A normal partial-output frame
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error_code: ErrorCode::Ok.into(),
        }
    }

    /// A terminal error frame
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error_code: code.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != i32::from(ErrorCode::Ok)
    }

    /// JSON bytes followed by the frame delimiter
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(FRAME_DELIMITER);
        Ok(Bytes::from(buf))
    }
}

/// Incremental splitter for NUL-delimited frame streams.
///
/// Chunks may cut frames anywhere; bytes are buffered until a delimiter
/// arrives. Empty segments are skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamFrame>, serde_json::Error> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == FRAME_DELIMITER) {
            let segment = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if segment.is_empty() {
                continue;
            }
            frames.push(serde_json::from_slice(&segment)?);
        }
        Ok(frames)
    }

    /// Bytes received after the last delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

// Worker status types

/// Body returned by `POST /worker_get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub model_names: Vec<String>,
    pub speed: f64,
    pub queue_length: usize,
}

// Controller types

/// Body of `POST /register_worker`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// The worker's reachable address
    pub worker_name: String,
    pub check_heart_beat: bool,
    #[serde(default)]
    pub worker_status: Option<WorkerStatus>,
}

/// Body of `POST /receive_heart_beat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_name: String,
    pub queue_length: usize,
}

/// Controller's answer to a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// False when the controller no longer knows this worker
    #[serde(alias = "exist")]
    pub exists: bool,
}

/// Body returned by `POST /list_models`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<String>,
}

/// Body of `POST /get_worker_address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddressRequest {
    pub model: String,
}

/// Answer to `get_worker_address`; empty when no worker serves the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddressResponse {
    pub address: String,
}
