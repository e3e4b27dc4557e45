//! ChatServe Worker
//!
//! Serves streaming text generation for one model. Requests pass through a
//! bounded concurrency gate, run as step-wise generation sessions over an
//! [`InferenceEngine`], and stream NUL-delimited JSON frames back. A
//! background reporter keeps the worker registered with the controller.

pub mod engine;
pub mod gate;
pub mod heartbeat;
pub mod http;
pub mod sampler;
pub mod service;
pub mod session;
pub mod tokenizer;
pub mod transcript;

pub use engine::{CacheHandle, DemoEngine, EngineError, InferenceEngine, ScriptedEngine};
pub use gate::{ConcurrencyGate, ConcurrencySlot, WorkerLoadSnapshot};
pub use heartbeat::{ControllerClient, HeartbeatReporter, RegistrationState};
pub use http::{HttpControllerClient, WorkerServer};
pub use service::{FrameStream, WorkerIdentity, WorkerService};
pub use session::{GenerationRequest, GenerationSession, PartialOutput, SessionState};
pub use tokenizer::{ByteTokenizer, Tokenizer};
pub use transcript::{MemoryTranscriptSink, Transcript, TracingTranscriptSink, TranscriptSink};
