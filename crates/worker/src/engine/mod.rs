//! Inference engine capability
//!
//! The worker never looks inside the model. It asks an [`InferenceEngine`]
//! for next-token logits, first over a whole prompt (`prefill`), then one
//! token at a time against state the engine keeps behind a [`CacheHandle`].
//! Handles are owned by the caller and must be handed back with `release`
//! exactly once; engines keep the backing state in an arena keyed by handle.

pub mod demo;
pub mod scripted;

use thiserror::Error;

pub use demo::DemoEngine;
pub use scripted::ScriptedEngine;

/// Owned reference to per-sequence state held by an engine.
///
/// Not `Clone`: whoever holds the handle is responsible for releasing it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CacheHandle(u64);

impl CacheHandle {
    /// Engines mint handles from their own id space
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Failures reported by an engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Out of accelerator memory or cache capacity
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The handle does not refer to live state
    #[error("unknown cache handle {0}")]
    UnknownCache(u64),

    /// Any other forward-pass failure
    #[error("engine failure: {0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EngineError::ResourceExhausted(_))
    }
}

impl From<EngineError> for chatserve_common::ServeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ResourceExhausted(msg) => chatserve_common::ServeError::ResourceExhausted(msg),
            other => chatserve_common::ServeError::Engine(other.to_string()),
        }
    }
}

/// Result of a prefill pass
#[derive(Debug)]
pub struct Prefill {
    /// Logits for the token following the prompt
    pub logits: Vec<f32>,

    /// State to pass to subsequent `decode` calls
    pub cache: CacheHandle,
}

/// Black-box next-token capability
pub trait InferenceEngine: Send + Sync {
    /// Maximum sequence length the engine accepts
    fn context_len(&self) -> usize;

    /// Length of every logit vector
    fn vocab_size(&self) -> usize;

    /// Run the whole prompt and keep reusable state
    fn prefill(&self, tokens: &[u32]) -> Result<Prefill, EngineError>;

    /// Extend cached state by one token
    fn decode(&self, token: u32, cache: &CacheHandle) -> Result<Vec<f32>, EngineError>;

    /// Free the state behind a handle
    fn release(&self, cache: CacheHandle);

    /// Number of handles not yet released
    fn live_caches(&self) -> usize;
}
