//! End-to-end transcription pipeline
//!
//! Orchestrates the components of one transcription:
//! 1. Audio loading, downmix and resampling
//! 2. Log-mel feature extraction
//! 3. Encoder and prefill decoder
//! 4. Incremental greedy generation
//! 5. Detokenization

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::{AudioClip, AudioLoader, FeatureExtractor};
use crate::config::ModelConfig;
use crate::decoding::{
    DecoderConfig, DecodingSession, SessionState, StageProfiler, StageSet, StopReason,
};
use crate::text::WhisperTokenizer;

/// Wall-clock time of each pipeline phase
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    /// Audio decoding, resampling and log-mel computation
    pub features: Duration,
    /// Encoder plus prefill decoder
    pub prefill: Duration,
    /// All incremental decoder steps
    pub generation: Duration,
    /// Everything above plus detokenization
    pub total: Duration,
}

impl PhaseTimings {
    /// Log one line per phase
    pub fn log_summary(&self) {
        info!("Feature extraction: {:.3}s", self.features.as_secs_f64());
        info!("Encoder + prefill:  {:.3}s", self.prefill.as_secs_f64());
        info!("Generation loop:    {:.3}s", self.generation.as_secs_f64());
        info!("Total:              {:.3}s", self.total.as_secs_f64());
    }
}

/// Result of one transcription
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Full token sequence, start token first
    pub tokens: Vec<u32>,
    /// Decoded text, special tokens removed (absent without a tokenizer)
    pub text: Option<String>,
    /// Why decoding stopped
    pub stop_reason: Option<StopReason>,
    /// Number of incremental decoder calls
    pub steps: usize,
    /// Per-phase timings
    pub timings: PhaseTimings,
    /// Duration of the input audio in seconds
    pub audio_duration: f32,
}

impl TranscriptionResult {
    /// Processing time divided by audio duration
    pub fn real_time_factor(&self) -> f32 {
        if self.audio_duration <= 0.0 {
            return 0.0;
        }
        self.timings.total.as_secs_f32() / self.audio_duration
    }
}

/// Greedy speech-to-text over a staged encoder-decoder model
pub struct Transcriber<'a> {
    decoder: DecoderConfig,
    features: FeatureExtractor,
    tokenizer: Option<WhisperTokenizer>,
    stages: StageSet<'a>,
    device: Device,
}

impl<'a> Transcriber<'a> {
    /// Build a transcriber
    ///
    /// The end-of-sequence token comes from the config when set, otherwise
    /// from the tokenizer.
    pub fn new(
        config: &ModelConfig,
        tokenizer: Option<WhisperTokenizer>,
        stages: StageSet<'a>,
        device: &Device,
    ) -> Result<Self> {
        let eos_token = match (config.decoding.eos_token, &tokenizer) {
            (Some(id), _) => id,
            (None, Some(tok)) => tok.eos_token_id,
            (None, None) => anyhow::bail!(
                "decoding.eos_token is not set and no tokenizer is available to resolve it"
            ),
        };
        if let Some(sot) = tokenizer.as_ref().and_then(|t| t.sot_token_id) {
            if sot != config.decoding.start_token {
                warn!(
                    "Configured start token {} differs from tokenizer's {}",
                    config.decoding.start_token, sot
                );
            }
        }

        let decoder = config.decoder_config(eos_token, config.dtype()?);
        decoder.validate().context("Invalid decoder configuration")?;
        let features = FeatureExtractor::from_config(config, device)?;

        Ok(Self {
            decoder,
            features,
            tokenizer,
            stages,
            device: device.clone(),
        })
    }

    /// Override the generation limit
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.decoder.max_length = max_length;
        self
    }

    /// Decoder configuration in use
    pub fn decoder_config(&self) -> &DecoderConfig {
        &self.decoder
    }

    /// Transcribe an audio file
    pub fn transcribe<P: AsRef<Path>>(
        &self,
        path: P,
        profiler: Option<&mut dyn StageProfiler>,
    ) -> Result<TranscriptionResult> {
        let path = path.as_ref();
        let clip = AudioLoader::load(path)?;
        info!(
            "Transcribing {:?} ({:.2}s, {} Hz, {} ch)",
            path,
            clip.duration(),
            clip.sample_rate,
            clip.channels
        );
        self.transcribe_clip(&clip, profiler)
    }

    /// Transcribe decoded audio
    pub fn transcribe_clip(
        &self,
        clip: &AudioClip,
        profiler: Option<&mut dyn StageProfiler>,
    ) -> Result<TranscriptionResult> {
        let start = Instant::now();
        let features = self.features.extract_clip(clip)?;
        let feature_time = start.elapsed();

        let mut result = self.transcribe_features(&features, profiler)?;
        result.timings.features = feature_time;
        result.timings.total = start.elapsed();
        result.audio_duration = clip.duration();
        Ok(result)
    }

    /// Decode precomputed `(1, n_mels, num_frames)` features
    pub fn transcribe_features(
        &self,
        features: &Tensor,
        profiler: Option<&mut dyn StageProfiler>,
    ) -> Result<TranscriptionResult> {
        let start = Instant::now();
        let features = features.to_device(&self.device)?;

        let mut session = DecodingSession::new(self.decoder.clone(), self.stages, &self.device)?;
        if let Some(profiler) = profiler {
            session = session.with_profiler(profiler);
        }

        let mut timings = PhaseTimings::default();
        session.begin(&features)?;
        timings.prefill = start.elapsed();

        let loop_start = Instant::now();
        while session.state() == SessionState::Incrementing {
            session.step()?;
        }
        timings.generation = loop_start.elapsed();
        debug!(
            "Generated {} tokens in {} steps",
            session.generated().len(),
            session.steps_taken()
        );

        let stop_reason = session.stop_reason();
        let steps = session.steps_taken();
        let tokens = session.into_tokens();
        let text = match self.tokenizer {
            Some(ref tok) => Some(tok.decode(&tokens)?),
            None => None,
        };
        timings.total = start.elapsed();

        Ok(TranscriptionResult {
            tokens,
            text,
            stop_reason,
            steps,
            timings,
            audio_duration: 0.0,
        })
    }
}
