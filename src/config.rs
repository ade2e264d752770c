//! Model configuration
//!
//! Loaded from a YAML file that sits next to the compiled stage artifacts.
//! Every field has a default matching Whisper tiny, so a config only needs
//! to list what differs.
//!
//! ```yaml
//! model:
//!   num_layers: 4
//!   num_heads: 6
//!   head_dim: 64
//!   encoder_seq_len: 1500
//!   hidden_dim: 384
//! decoding:
//!   start_token: 50258
//!   max_length: 64
//! artifacts:
//!   encoder: onnx/encoder_model.onnx
//!   decoder_prefill: onnx/decoder_model.onnx
//!   decoder_incremental: onnx/decoder_with_past_model.onnx
//!   tokenizer: tokenizer.json
//! ```

use anyhow::{Context, Result};
use candle_core::DType;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::decoding::{CacheConfig, DecoderConfig};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Static shapes
    pub model: ModelSection,
    /// Greedy decoding parameters
    pub decoding: DecodingSection,
    /// Feature extraction
    pub audio: AudioSection,
    /// Stage and tokenizer files
    pub artifacts: ArtifactPaths,
}

/// Static shapes baked into the compiled artifacts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Decoder layers
    pub num_layers: usize,
    /// Attention heads per layer
    pub num_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Encoder output positions
    pub encoder_seq_len: usize,
    /// Encoder hidden width
    pub hidden_dim: usize,
    /// Mel bands of the encoder input
    pub num_mel_bins: usize,
    /// Frames of the encoder input
    pub num_frames: usize,
    /// Element type name (`f32`, `f16`, `bf16`)
    pub dtype: String,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            num_layers: 4,
            num_heads: 6,
            head_dim: 64,
            encoder_seq_len: 1500,
            hidden_dim: 384,
            num_mel_bins: 80,
            num_frames: 3000,
            dtype: "f32".to_string(),
        }
    }
}

/// Greedy decoding parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodingSection {
    /// Token fed to the prefill stage
    pub start_token: u32,
    /// Resolved from the tokenizer when absent
    pub eos_token: Option<u32>,
    /// Maximum generated tokens, at least 1
    pub max_length: usize,
}

impl Default for DecodingSection {
    fn default() -> Self {
        Self {
            start_token: 50258,
            eos_token: None,
            max_length: 64,
        }
    }
}

/// Feature extraction parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Rate the features are computed at
    pub sample_rate: u32,
    /// FFT size
    pub n_fft: usize,
    /// STFT hop
    pub hop_length: usize,
    /// Precomputed mel filterbank (safetensors, `mel_<bins>` tensor);
    /// computed on the fly when absent
    pub mel_filters: Option<PathBuf>,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: crate::SAMPLE_RATE,
            n_fft: 400,
            hop_length: 160,
            mel_filters: None,
        }
    }
}

/// Locations of the compiled stages and the tokenizer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    /// Encoder graph
    pub encoder: PathBuf,
    /// Decoder graph without past key/values
    pub decoder_prefill: PathBuf,
    /// Decoder graph with past key/values
    pub decoder_incremental: PathBuf,
    /// `tokenizer.json`
    pub tokenizer: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            encoder: PathBuf::from("onnx/encoder_model.onnx"),
            decoder_prefill: PathBuf::from("onnx/decoder_model.onnx"),
            decoder_incremental: PathBuf::from("onnx/decoder_with_past_model.onnx"),
            tokenizer: PathBuf::from("tokenizer.json"),
        }
    }
}

impl ModelConfig {
    /// Load from a YAML file; relative artifact paths resolve against the
    /// file's directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;

        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ModelConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Make relative paths absolute with respect to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.artifacts.encoder);
        resolve(&mut self.artifacts.decoder_prefill);
        resolve(&mut self.artifacts.decoder_incremental);
        resolve(&mut self.artifacts.tokenizer);
        if let Some(ref mut filters) = self.audio.mel_filters {
            resolve(filters);
        }
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        let dtype = self.dtype()?;
        self.decoder_config(self.decoding.eos_token.unwrap_or(0), dtype)
            .validate()
            .context("Invalid model section")?;

        if self.audio.sample_rate == 0 || self.audio.n_fft == 0 || self.audio.hop_length == 0 {
            anyhow::bail!(
                "audio.sample_rate, audio.n_fft and audio.hop_length must be greater than 0"
            );
        }
        Ok(())
    }

    /// Element type of features and cache tensors
    pub fn dtype(&self) -> Result<DType> {
        match self.model.dtype.parse::<DType>() {
            Ok(dt @ (DType::F32 | DType::F16 | DType::BF16)) => Ok(dt),
            _ => anyhow::bail!("Unsupported model dtype: {}", self.model.dtype),
        }
    }

    /// Engine configuration with a resolved end-of-sequence token
    pub fn decoder_config(&self, eos_token: u32, dtype: DType) -> DecoderConfig {
        DecoderConfig {
            cache: CacheConfig {
                num_layers: self.model.num_layers,
                num_heads: self.model.num_heads,
                head_dim: self.model.head_dim,
                encoder_seq_len: self.model.encoder_seq_len,
                dtype,
            },
            hidden_dim: self.model.hidden_dim,
            num_mel_bins: self.model.num_mel_bins,
            num_frames: self.model.num_frames,
            start_token: self.decoding.start_token,
            eos_token,
            max_length: self.decoding.max_length,
        }
    }
}
