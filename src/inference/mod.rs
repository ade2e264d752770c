//! Inference module for speech-to-text transcription
//!
//! - Transcriber: audio file to tokens and text
//! - TranscriptionResult / PhaseTimings: output and per-phase timing

mod pipeline;

pub use pipeline::{PhaseTimings, TranscriptionResult, Transcriber};
