//! Tokenizer capability and a byte-level implementation

use chatserve_common::Result;

/// Text ↔ token id conversion used by generation sessions
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids back to text, skipping special tokens
    fn decode(&self, ids: &[u32]) -> String;

    /// Id that marks the end of a sequence
    fn eos_token_id(&self) -> u32;
}

/// One token per UTF-8 byte plus an end-of-sequence marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS: u32 = 256;
    pub const VOCAB_SIZE: usize = 257;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    /// A trailing partial UTF-8 sequence decodes as U+FFFD; the next frame,
    /// which re-decodes the whole sequence, carries the completed character.
    fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }
}
