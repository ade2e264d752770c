//! Whisper tokenizer
//!
//! Wrapper around HuggingFace tokenizers for turning generated ids into text
//! and for resolving the special tokens the decoder loop depends on

use anyhow::{Context, Result};
use std::path::Path;
use tokenizers::Tokenizer;

/// Start-of-transcript marker
pub const START_OF_TRANSCRIPT: &str = "<|startoftranscript|>";
/// End-of-text marker
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Tokenizer with the special token ids resolved once at load time
pub struct WhisperTokenizer {
    /// Underlying HuggingFace tokenizer
    tokenizer: Tokenizer,
    /// `<|startoftranscript|>` id, if present in the vocabulary
    pub sot_token_id: Option<u32>,
    /// `<|endoftext|>` id
    pub eos_token_id: u32,
}

impl WhisperTokenizer {
    /// Load from a `tokenizer.json` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {:?}: {}", path, e))?;
        Self::from_tokenizer(tokenizer)
    }

    /// Wrap an already constructed tokenizer
    pub fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        let eos_token_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .with_context(|| format!("Tokenizer has no {} token", END_OF_TEXT))?;
        let sot_token_id = tokenizer.token_to_id(START_OF_TRANSCRIPT);

        Ok(Self {
            tokenizer,
            sot_token_id,
            eos_token_id,
        })
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Look up a single token
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Decode ids to text, dropping special tokens
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Detokenization failed: {}", e))?;
        Ok(text.trim().to_string())
    }

    /// Convert token ids back to token strings, special tokens included
    pub fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .filter_map(|&id| self.tokenizer.id_to_token(id))
            .collect()
    }
}
