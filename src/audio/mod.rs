//! Audio front end
//!
//! - WAV decoding into an interleaved clip
//! - Channel downmix and sample rate conversion (16kHz)
//! - Whisper log-mel spectrogram (80 bands, fixed frame count)
//! - Feature extraction producing the encoder input tensor

mod features;
mod loader;
mod mel;
mod resampler;

pub use features::FeatureExtractor;
pub use loader::{AudioClip, AudioLoader};
pub use mel::MelSpectrogram;
pub use resampler::Resampler;
