//! Text processing
//!
//! - Whisper tokenizer wrapper (special token lookup, detokenization)

mod tokenizer;

pub use tokenizer::{WhisperTokenizer, END_OF_TEXT, START_OF_TRANSCRIPT};
