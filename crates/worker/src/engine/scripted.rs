//! Replay engine
//!
//! Emits a fixed token script regardless of the prompt, one token per step,
//! then the end marker forever. Every call is recorded, an out-of-memory
//! failure can be armed for a given step, and each step can be slowed down.
//! Used to exercise the serving path deterministically.

use super::{CacheHandle, EngineError, InferenceEngine, Prefill};
use crate::tokenizer::ByteTokenizer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// One recorded engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Prefill(Vec<u32>),
    Decode(u32),
}

#[derive(Debug, Default)]
struct ScriptState {
    /// cache id → next script position
    positions: HashMap<u64, usize>,
    next_id: u64,
    calls: Vec<EngineCall>,
    /// Step index at which the next exhaustion fires (0 = prefill)
    fail_at: Option<usize>,
}

pub struct ScriptedEngine {
    script: Vec<u32>,
    end_token: u32,
    vocab_size: usize,
    context_len: usize,
    step_delay: Option<Duration>,
    state: Mutex<ScriptState>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<u32>, end_token: u32, vocab_size: usize) -> Self {
        Self {
            script,
            end_token,
            vocab_size,
            context_len: 2048,
            step_delay: None,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Script the UTF-8 bytes of `text` for a [`ByteTokenizer`]
    pub fn from_text(text: &str) -> Self {
        Self::new(
            text.bytes().map(u32::from).collect(),
            ByteTokenizer::EOS,
            ByteTokenizer::VOCAB_SIZE,
        )
    }

    pub fn with_context_len(mut self, context_len: usize) -> Self {
        self.context_len = context_len;
        self
    }

    /// Sleep this long inside every prefill/decode
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Make the next sequence reaching `step` fail with resource exhaustion.
    /// Fires once.
    pub fn fail_once_at(self, step: usize) -> Self {
        self.state.lock().fail_at = Some(step);
        self
    }

    /// Arm a one-shot exhaustion on an engine that is already shared
    pub fn arm_failure(&self, step: usize) {
        self.state.lock().fail_at = Some(step);
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    fn one_hot(&self, position: usize) -> Vec<f32> {
        let token = self.script.get(position).copied().unwrap_or(self.end_token);
        let mut logits = vec![0.0f32; self.vocab_size];
        if let Some(slot) = logits.get_mut(token as usize) {
            *slot = 10.0;
        }
        logits
    }

    fn check_failure(state: &mut ScriptState, step: usize) -> Result<(), EngineError> {
        if state.fail_at == Some(step) {
            state.fail_at = None;
            return Err(EngineError::ResourceExhausted(format!(
                "injected out-of-memory at step {}",
                step
            )));
        }
        Ok(())
    }

    fn pause(&self) {
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn context_len(&self) -> usize {
        self.context_len
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn prefill(&self, tokens: &[u32]) -> Result<Prefill, EngineError> {
        self.pause();
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Prefill(tokens.to_vec()));
        Self::check_failure(&mut state, 0)?;

        let id = state.next_id;
        state.next_id += 1;
        state.positions.insert(id, 1);

        Ok(Prefill {
            logits: self.one_hot(0),
            cache: CacheHandle::new(id),
        })
    }

    fn decode(&self, token: u32, cache: &CacheHandle) -> Result<Vec<f32>, EngineError> {
        self.pause();
        let mut state = self.state.lock();
        state.calls.push(EngineCall::Decode(token));

        let position = *state
            .positions
            .get(&cache.id())
            .ok_or(EngineError::UnknownCache(cache.id()))?;
        Self::check_failure(&mut state, position)?;

        state.positions.insert(cache.id(), position + 1);
        Ok(self.one_hot(position))
    }

    fn release(&self, cache: CacheHandle) {
        self.state.lock().positions.remove(&cache.id());
    }

    fn live_caches(&self) -> usize {
        self.state.lock().positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::argmax;

    #[test]
    fn test_replays_script_then_end_token() {
        let engine = ScriptedEngine::from_text("ab");
        let prefill = engine.prefill(&[1, 2]).unwrap();
        assert_eq!(argmax(&prefill.logits), Some(u32::from(b'a')));
        let next = engine.decode(u32::from(b'a'), &prefill.cache).unwrap();
        assert_eq!(argmax(&next), Some(u32::from(b'b')));
        let end = engine.decode(u32::from(b'b'), &prefill.cache).unwrap();
        assert_eq!(argmax(&end), Some(ByteTokenizer::EOS));

        engine.release(prefill.cache);
        assert_eq!(engine.live_caches(), 0);
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Prefill(vec![1, 2]),
                EngineCall::Decode(u32::from(b'a')),
                EngineCall::Decode(u32::from(b'b')),
            ]
        );
    }

    #[test]
    fn test_failure_fires_once() {
        let engine = ScriptedEngine::from_text("abc").fail_once_at(1);
        let prefill = engine.prefill(&[]).unwrap();
        assert!(engine.decode(0, &prefill.cache).unwrap_err().is_resource_exhausted());
        assert!(engine.decode(0, &prefill.cache).is_ok());
        engine.release(prefill.cache);
    }
}
