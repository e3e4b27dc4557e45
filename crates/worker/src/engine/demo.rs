//! Deterministic demonstration engine
//!
//! Produces plausible-looking lowercase text from a rolling hash of the
//! sequence so the serving path can run without model weights. Per-sequence
//! state lives in an arena with a fixed number of slots; asking for more
//! than that is reported as resource exhaustion, the same way an
//! accelerator running out of KV-cache memory would be.

use super::{CacheHandle, EngineError, InferenceEngine, Prefill};
use crate::tokenizer::ByteTokenizer;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

const ALPHABET: &[u8] = b"etaoinshrdlucmfwypvbgk";
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Per-sequence state kept behind a cache handle
#[derive(Debug, Clone)]
struct SequenceState {
    /// Rolling hash of every token seen so far
    hash: u64,

    /// Tokens consumed (prompt + decoded)
    len: usize,

    /// Tokens decoded after the prompt
    generated: usize,
}

impl SequenceState {
    fn new() -> Self {
        Self {
            hash: FNV_OFFSET,
            len: 0,
            generated: 0,
        }
    }

    fn push(&mut self, token: u32) {
        for byte in token.to_le_bytes() {
            self.hash ^= u64::from(byte);
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
        self.len += 1;
    }
}

#[derive(Debug, Default)]
struct Arena {
    sequences: HashMap<u64, SequenceState>,
    next_id: u64,
}

/// Byte-vocabulary pseudo-model backed by a bounded state arena
pub struct DemoEngine {
    context_len: usize,
    max_cached_sequences: usize,
    arena: Mutex<Arena>,
}

impl DemoEngine {
    pub fn new(context_len: usize, max_cached_sequences: usize) -> Self {
        Self {
            context_len,
            max_cached_sequences,
            arena: Mutex::new(Arena::default()),
        }
    }

    fn logits(&self, state: &SequenceState) -> Vec<f32> {
        let mut logits = vec![-8.0f32; ByteTokenizer::VOCAB_SIZE];

        for &b in ALPHABET {
            logits[b as usize] = 0.0;
        }
        logits[b' ' as usize] = 0.5;

        // The hash picks one strongly favoured continuation
        let favoured = ALPHABET[(state.hash % ALPHABET.len() as u64) as usize];
        logits[favoured as usize] += 4.0;
        if state.hash % 5 == 0 {
            logits[b' ' as usize] += 4.5;
        }

        // EOS becomes likely as the continuation grows
        logits[ByteTokenizer::EOS as usize] = -10.0 + state.generated as f32 * 0.1;

        logits
    }
}

impl InferenceEngine for DemoEngine {
    fn context_len(&self) -> usize {
        self.context_len
    }

    fn vocab_size(&self) -> usize {
        ByteTokenizer::VOCAB_SIZE
    }

    fn prefill(&self, tokens: &[u32]) -> Result<Prefill, EngineError> {
        if tokens.len() > self.context_len {
            return Err(EngineError::Failed(format!(
                "prompt of {} tokens exceeds context length {}",
                tokens.len(),
                self.context_len
            )));
        }

        let mut arena = self.arena.lock();
        if arena.sequences.len() >= self.max_cached_sequences {
            return Err(EngineError::ResourceExhausted(format!(
                "all {} cache slots are in use",
                self.max_cached_sequences
            )));
        }

        let mut state = SequenceState::new();
        for &token in tokens {
            state.push(token);
        }
        let logits = self.logits(&state);

        let id = arena.next_id;
        arena.next_id += 1;
        arena.sequences.insert(id, state);

        debug!("Prefilled {} tokens into cache {}", tokens.len(), id);
        Ok(Prefill {
            logits,
            cache: CacheHandle::new(id),
        })
    }

    fn decode(&self, token: u32, cache: &CacheHandle) -> Result<Vec<f32>, EngineError> {
        let mut arena = self.arena.lock();
        let state = arena
            .sequences
            .get_mut(&cache.id())
            .ok_or(EngineError::UnknownCache(cache.id()))?;

        if state.len >= self.context_len {
            return Err(EngineError::Failed(format!(
                "sequence reached context length {}",
                self.context_len
            )));
        }

        state.push(token);
        state.generated += 1;
        trace!("Decoded token {} into cache {}", token, cache.id());
        Ok(self.logits(state))
    }

    fn release(&self, cache: CacheHandle) {
        if self.arena.lock().sequences.remove(&cache.id()).is_none() {
            debug!("Release of unknown cache {}", cache.id());
        }
    }

    fn live_caches(&self) -> usize {
        self.arena.lock().sequences.len()
    }
}
