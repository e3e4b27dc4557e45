//! Incremental decode loop for one request
//!
//! A [`GenerationSession`] is an iterator of [`PartialOutput`]s. Each call to
//! `next` runs decode steps until a frame is due, so the caller controls the
//! pace and can stop pulling at any time. Once a terminal state is reached the
//! engine cache is released and the iterator is exhausted; dropping a session
//! early releases the cache as well.

use crate::engine::{CacheHandle, EngineError, InferenceEngine};
use crate::sampler;
use crate::tokenizer::Tokenizer;
use chatserve_common::{Result, ServeError};
use chatserve_proto::{ErrorCode, GenerateStreamParams, StreamFrame, SERVER_ERROR_MSG};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Tokens kept free between the truncated prompt and the context limit
const CONTEXT_MARGIN: usize = 8;

/// Bounds a request is validated against
#[derive(Debug, Clone)]
pub struct RequestLimits {
    /// Model this worker serves
    pub model_name: String,

    /// Engine context length
    pub context_len: usize,

    /// Requests asking for more new tokens are clamped to this
    pub max_new_tokens_cap: usize,
}

/// A validated generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_new_tokens: usize,
    /// Never empty; an empty stop string is dropped during validation
    pub stop_sequence: Option<String>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Validate wire parameters against the worker's limits
    pub fn from_params(params: GenerateStreamParams, limits: &RequestLimits) -> Result<Self> {
        if !params.model.is_empty() && params.model != limits.model_name {
            return Err(ServeError::invalid_input(format!(
                "model {} is not served by this worker (serving {})",
                params.model, limits.model_name
            )));
        }

        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(ServeError::invalid_input(format!(
                "temperature must be a finite number >= 0, got {}",
                params.temperature
            )));
        }

        if params.max_new_tokens < 1 {
            return Err(ServeError::invalid_input(format!(
                "max_new_tokens must be positive, got {}",
                params.max_new_tokens
            )));
        }
        let max_new_tokens = (params.max_new_tokens as u64).min(limits.max_new_tokens_cap as u64) as usize;

        if max_new_tokens + CONTEXT_MARGIN >= limits.context_len {
            return Err(ServeError::invalid_input(format!(
                "max_new_tokens {} leaves no room for the prompt in a {} token context",
                max_new_tokens, limits.context_len
            )));
        }

        Ok(Self {
            prompt: params.prompt,
            temperature: params.temperature,
            max_new_tokens,
            stop_sequence: params.stop.filter(|s| !s.is_empty()),
            seed: params.seed,
        })
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    StoppedEos,
    StoppedMaxLen,
    StoppedStopString,
    Failed,
    /// The consumer went away before a natural stop
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self != SessionState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::StoppedEos => "stopped_eos",
            SessionState::StoppedMaxLen => "stopped_max_len",
            SessionState::StoppedStopString => "stopped_stop_string",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// One emitted frame plus bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct PartialOutput {
    /// Decode step that produced this output
    pub step: usize,

    /// Prompt plus continuation so far, or the error message
    pub text: String,

    pub error_code: ErrorCode,

    /// Session state after this step
    pub state: SessionState,
}

impl PartialOutput {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn to_frame(&self) -> StreamFrame {
        StreamFrame {
            text: self.text.clone(),
            error_code: self.error_code.into(),
        }
    }
}

/// Mutable state owned by one session
#[derive(Debug)]
struct GenerationState {
    /// Full prompt followed by every sampled token
    accumulated_token_ids: Vec<u32>,

    /// Engine state carried between steps
    cached_engine_state: Option<CacheHandle>,

    /// Steps completed
    step_count: usize,
}

type CancelCheck = Box<dyn Fn() -> bool + Send>;

/// Drives one request's decode loop
pub struct GenerationSession {
    engine: Arc<dyn InferenceEngine>,
    tokenizer: Arc<dyn Tokenizer>,
    request: GenerationRequest,
    stream_interval: usize,
    /// Prompt length in characters; stop search starts here
    l_prompt: usize,
    /// Truncated prompt sent at step 0
    input_ids: Vec<u32>,
    prompt_tokens: usize,
    eos_token_id: u32,
    rng: StdRng,
    state: SessionState,
    generation: GenerationState,
    cancel_check: Option<CancelCheck>,
    /// Set when the session ends in `Failed`
    failure: Option<EngineError>,
}

impl GenerationSession {
    /// Tokenize and truncate the prompt. No engine work happens until the
    /// first call to `next`.
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        tokenizer: Arc<dyn Tokenizer>,
        request: GenerationRequest,
        stream_interval: usize,
    ) -> Result<Self> {
        if stream_interval == 0 {
            return Err(ServeError::invalid_input("stream_interval must be at least 1"));
        }
        if request.max_new_tokens == 0 {
            return Err(ServeError::invalid_input("max_new_tokens must be at least 1"));
        }

        let context_len = engine.context_len();
        let max_src_len = context_len
            .checked_sub(request.max_new_tokens + CONTEXT_MARGIN)
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                ServeError::invalid_input(format!(
                    "max_new_tokens {} does not fit a {} token context",
                    request.max_new_tokens, context_len
                ))
            })?;

        let prompt_ids = tokenizer.encode(&request.prompt)?;
        let start = prompt_ids.len().saturating_sub(max_src_len);
        if start > 0 {
            debug!(
                "Truncating prompt from {} to {} tokens",
                prompt_ids.len(),
                max_src_len
            );
        }
        let input_ids = prompt_ids[start..].to_vec();

        let rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            eos_token_id: tokenizer.eos_token_id(),
            l_prompt: request.prompt.chars().count(),
            prompt_tokens: prompt_ids.len(),
            input_ids,
            engine,
            tokenizer,
            stream_interval,
            rng,
            state: SessionState::Running,
            generation: GenerationState {
                accumulated_token_ids: prompt_ids,
                cached_engine_state: None,
                step_count: 0,
            },
            request,
            cancel_check: None,
            failure: None,
        })
    }

    /// Poll `check` before every engine call; when it returns true the session
    /// ends as cancelled without emitting another frame
    pub fn with_cancel_check(mut self, check: impl Fn() -> bool + Send + 'static) -> Self {
        self.cancel_check = Some(Box::new(check));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// Tokens sampled so far
    pub fn generated_tokens(&self) -> usize {
        self.generation.step_count
    }

    /// Tokens in the prompt before truncation
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Tokens actually sent to the engine at step 0
    pub fn input_tokens(&self) -> usize {
        self.input_ids.len()
    }

    /// Engine error that ended the session, if any
    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub fn holds_engine_state(&self) -> bool {
        self.generation.cached_engine_state.is_some()
    }

    /// End the session early, releasing engine state
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            debug!("Session cancelled at step {}", self.generation.step_count);
            self.state = SessionState::Cancelled;
        }
        self.release_engine_state();
    }

    fn release_engine_state(&mut self) {
        if let Some(cache) = self.generation.cached_engine_state.take() {
            trace!("Releasing engine cache {}", cache.id());
            self.engine.release(cache);
        }
    }

    /// Step 0 sends the whole prompt; later steps send only the newest token
    fn forward(&mut self) -> std::result::Result<Vec<f32>, EngineError> {
        if self.generation.step_count == 0 {
            let prefill = self.engine.prefill(&self.input_ids)?;
            self.generation.cached_engine_state = Some(prefill.cache);
            return Ok(prefill.logits);
        }

        let cache = self.generation.cached_engine_state.as_ref().ok_or_else(|| {
            EngineError::Failed(format!(
                "engine state missing at step {}",
                self.generation.step_count
            ))
        })?;
        let last = self
            .generation
            .accumulated_token_ids
            .last()
            .copied()
            .ok_or_else(|| EngineError::Failed("no token to decode".to_string()))?;
        self.engine.decode(last, cache)
    }

    /// Decode the whole sequence and cut it at the first stop sequence found
    /// after the prompt. Returns whether a stop sequence matched.
    fn render(&self) -> (String, bool) {
        let mut text = self.tokenizer.decode(&self.generation.accumulated_token_ids);

        let Some(stop) = self.request.stop_sequence.as_deref() else {
            return (text, false);
        };

        let search_from = text
            .char_indices()
            .nth(self.l_prompt)
            .map(|(i, _)| i)
            .unwrap_or(text.len());

        match text[search_from..].find(stop) {
            Some(pos) => {
                text.truncate(search_from + pos);
                (text, true)
            }
            None => (text, false),
        }
    }

    fn fail(&mut self, step: usize, err: EngineError) -> PartialOutput {
        if err.is_resource_exhausted() {
            error!("Engine out of memory at step {}: {}", step, err);
        } else {
            error!("Engine failure at step {}: {}", step, err);
        }
        self.state = SessionState::Failed;
        self.failure = Some(err);
        self.release_engine_state();

        PartialOutput {
            step,
            text: SERVER_ERROR_MSG.to_string(),
            error_code: ErrorCode::ResourceExhausted,
            state: self.state,
        }
    }
}

impl Iterator for GenerationSession {
    type Item = PartialOutput;

    fn next(&mut self) -> Option<PartialOutput> {
        while self.state == SessionState::Running {
            if self.cancel_check.as_ref().is_some_and(|check| check()) {
                self.cancel();
                return None;
            }

            let step = self.generation.step_count;
            let logits = match self.forward() {
                Ok(logits) => logits,
                Err(err) => return Some(self.fail(step, err)),
            };

            let token = match sampler::sample(&logits, self.request.temperature, &mut self.rng) {
                Some(token) => token,
                None => {
                    return Some(self.fail(step, EngineError::Failed("empty distribution".to_string())))
                }
            };

            self.generation.accumulated_token_ids.push(token);
            self.generation.step_count += 1;

            if token == self.eos_token_id {
                self.state = SessionState::StoppedEos;
            } else if step + 1 >= self.request.max_new_tokens {
                self.state = SessionState::StoppedMaxLen;
            }

            if step % self.stream_interval == 0 || self.state.is_terminal() {
                let (text, stop_hit) = self.render();
                if stop_hit {
                    self.state = SessionState::StoppedStopString;
                }
                if self.state.is_terminal() {
                    debug!(
                        "Session finished at step {} ({})",
                        step,
                        self.state.as_str()
                    );
                    self.release_engine_state();
                }

                trace!("Frame at step {}: {} bytes", step, text.len());
                return Some(PartialOutput {
                    step,
                    text,
                    error_code: ErrorCode::Ok,
                    state: self.state,
                });
            }
        }
        None
    }
}

impl Drop for GenerationSession {
    fn drop(&mut self) {
        if self.generation.cached_engine_state.is_some() {
            warn!(
                "Session dropped while running at step {}, releasing engine state",
                self.generation.step_count
            );
            self.release_engine_state();
        }
    }
}
