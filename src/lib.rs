//! # staged-whisper
//!
//! Greedy speech-to-text decoding over a Whisper-style encoder-decoder that
//! has been compiled into three separate stages: an encoder, a decoder
//! prefill and an incremental decoder with a key/value cache.
//!
//! ## Features
//!
//! - Explicit cache bank with a per-layer slot layout
//! - Session state machine driving encoder, prefill and incremental stages
//! - Optional per-stage profiling
//! - Whisper log-mel front end and tokenizer wrapper
//! - ONNX stage runtime via candle-onnx (`onnx` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use staged_whisper::{runtime::OnnxStages, ModelConfig, Transcriber, WhisperTokenizer};
//!
//! let config = ModelConfig::load("whisper-tiny/config.yaml")?;
//! let stages = OnnxStages::load(&config)?;
//! let tokenizer = WhisperTokenizer::load(&config.artifacts.tokenizer)?;
//! let transcriber = Transcriber::new(&config, Some(tokenizer), stages.as_stage_set(), &Device::Cpu)?;
//! let result = transcriber.transcribe("speech.wav", None)?;
//! println!("{}", result.text.unwrap_or_default());
//! ```

// Require docs for public items
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod audio;
pub mod config;
pub mod decoding;
pub mod error;
pub mod inference;
pub mod runtime;
pub mod text;

// Re-exports for convenience
pub use config::ModelConfig;
pub use decoding::{
    CacheBank, DecoderConfig, DecodingSession, ModelStage, SessionState, StageRunner, StageSet,
    StageTimings, StopReason, TokenSelector,
};
pub use error::{DecodeError, Result};
pub use inference::{TranscriptionResult, Transcriber};
pub use text::WhisperTokenizer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sample rate the encoder features are computed at
pub const SAMPLE_RATE: u32 = 16000;
