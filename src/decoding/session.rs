//! Decoding session state machine
//!
//! Drives one input through the staged model:
//!
//! ```text
//! Uninitialized -> Encoding -> Prefilling -> Incrementing -> Terminated
//! ```
//!
//! The encoder and the prefill decoder each run exactly once. The
//! incremental decoder then runs once per generated token, each call
//! observing the cache exactly as the previous call left it. Any error moves
//! the session to `Aborted`; a finished or aborted session never calls a
//! stage again.

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use super::cache::{CacheBank, CacheConfig};
use super::profile::StageProfiler;
use super::selector::TokenSelector;
use super::stage::{token_tensor, ModelStage, StageSet};
use crate::error::{DecodeError, Result};

/// Static shapes and token ids the staged model was compiled for
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Cache dimensions (layers, heads, head dim, encoder length, dtype)
    pub cache: CacheConfig,
    /// Width of the encoder hidden state
    pub hidden_dim: usize,
    /// Mel bins of the encoder input features
    pub num_mel_bins: usize,
    /// Frames of the encoder input features
    pub num_frames: usize,
    /// Token fed to the prefill stage
    pub start_token: u32,
    /// Token that ends decoding
    pub eos_token: u32,
    /// Maximum number of generated tokens (excluding the start token)
    pub max_length: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            hidden_dim: 384,
            num_mel_bins: 80,
            num_frames: 3000,
            start_token: 50258,
            eos_token: 50257,
            max_length: 64,
        }
    }
}

impl DecoderConfig {
    /// Check dimensions before any stage is touched
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        for (name, value) in [
            ("hidden_dim", self.hidden_dim),
            ("num_mel_bins", self.num_mel_bins),
            ("num_frames", self.num_frames),
        ] {
            if value == 0 {
                return Err(DecodeError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.max_length == 0 {
            return Err(DecodeError::Configuration(
                "max_length must be at least 1, prefill always emits a token".to_string(),
            ));
        }
        Ok(())
    }

    /// Expected encoder input shape `(1, num_mel_bins, num_frames)`
    pub fn feature_shape(&self) -> [usize; 3] {
        [1, self.num_mel_bins, self.num_frames]
    }

    /// Expected encoder output shape `(1, encoder_seq_len, hidden_dim)`
    pub fn hidden_shape(&self) -> [usize; 3] {
        [1, self.cache.encoder_seq_len, self.hidden_dim]
    }

    /// Element type of features and cache tensors
    pub fn dtype(&self) -> DType {
        self.cache.dtype
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no stage called yet
    Uninitialized,
    /// Encoder running
    Encoding,
    /// Encoder done, prefill decoder pending or running
    Prefilling,
    /// Incremental decoding loop
    Incrementing,
    /// Finished normally; absorbing
    Terminated,
    /// An error escaped a stage-driving call; absorbing
    Aborted,
}

impl SessionState {
    /// Whether no further stage call is allowed
    pub fn is_closed(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Aborted)
    }
}

/// Why a session reached `Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-sequence token was generated
    EndOfSequence,
    /// `max_length` tokens were generated
    MaxLength,
}

/// One greedy decoding run over a staged encoder-decoder model
pub struct DecodingSession<'a> {
    config: DecoderConfig,
    stages: StageSet<'a>,
    profiler: Option<&'a mut dyn StageProfiler>,
    selector: TokenSelector,
    device: Device,
    state: SessionState,
    tokens: Vec<u32>,
    cache: CacheBank,
    encoder_hidden: Option<Tensor>,
    steps: usize,
    stop_reason: Option<StopReason>,
}

impl<'a> DecodingSession<'a> {
    /// Validate `config` and allocate an empty cache bank on `device`
    pub fn new(config: DecoderConfig, stages: StageSet<'a>, device: &Device) -> Result<Self> {
        config.validate()?;
        let cache = CacheBank::initialize(config.cache, device)?;
        let tokens = vec![config.start_token];

        Ok(Self {
            config,
            stages,
            profiler: None,
            selector: TokenSelector::new(),
            device: device.clone(),
            state: SessionState::Uninitialized,
            tokens,
            cache,
            encoder_hidden: None,
            steps: 0,
            stop_reason: None,
        })
    }

    /// Lend a profiler that receives the timing of every stage call
    pub fn with_profiler(mut self, profiler: &'a mut dyn StageProfiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Run the whole session to `Terminated` and return the token sequence
    /// (start token included)
    pub fn start(&mut self, features: &Tensor) -> Result<Vec<u32>> {
        self.begin(features)?;
        while self.state == SessionState::Incrementing {
            self.step()?;
        }
        info!(
            "Decoding finished after {} incremental steps ({:?}), {} tokens",
            self.steps,
            self.stop_reason,
            self.tokens.len()
        );
        Ok(self.tokens.clone())
    }

    /// Run the encoder and the prefill decoder
    ///
    /// Leaves the session in `Incrementing`, or in `Terminated` when the
    /// first generated token already ends the sequence or `max_length == 1`.
    pub fn begin(&mut self, features: &Tensor) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(DecodeError::InvalidState {
                operation: "begin",
                state: self.state,
            });
        }
        self.guard(|session| {
            session.encode(features)?;
            session.prefill()
        })
    }

    /// Run one incremental decoder call and return the token it produced
    pub fn step(&mut self) -> Result<u32> {
        if self.state != SessionState::Incrementing {
            return Err(DecodeError::InvalidState {
                operation: "step",
                state: self.state,
            });
        }
        self.guard(Self::increment)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token sequence so far, start token first
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Tokens produced by the decoder (everything after the start token)
    pub fn generated(&self) -> &[u32] {
        &self.tokens[1..]
    }

    /// Cache bank as left by the last stage call
    pub fn cache(&self) -> &CacheBank {
        &self.cache
    }

    /// Number of incremental decoder calls made
    pub fn steps_taken(&self) -> usize {
        self.steps
    }

    /// Why the session terminated, once it has
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Configuration the session was built with
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Consume the session and keep its tokens
    pub fn into_tokens(self) -> Vec<u32> {
        self.tokens
    }

    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        if let Err(ref e) = result {
            warn!("Decoding aborted in {:?}: {}", self.state, e);
            self.state = SessionState::Aborted;
        }
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn invoke(&mut self, stage: ModelStage, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let runner = self.stages.runner(stage);
        let layout = *self.cache.layout();
        stage.invoke(runner, inputs, &layout, self.profiler.as_deref_mut())
    }

    fn encode(&mut self, features: &Tensor) -> Result<()> {
        self.transition(SessionState::Encoding);
        check_shape("encoder features", &self.config.feature_shape(), features.dims())?;

        let outputs = self.invoke(ModelStage::Encoder, vec![features.clone()])?;
        let hidden = first(ModelStage::Encoder, outputs)?;
        check_shape("encoder hidden state", &self.config.hidden_shape(), hidden.dims())?;

        self.encoder_hidden = Some(hidden);
        self.transition(SessionState::Prefilling);
        Ok(())
    }

    fn prefill(&mut self) -> Result<()> {
        let hidden = self.encoder_hidden.take().ok_or(DecodeError::InvalidState {
            operation: "prefill without encoder output",
            state: self.state,
        })?;
        let token = token_tensor(self.config.start_token, &self.device)?;

        let mut outputs = self.invoke(ModelStage::DecoderPrefill, vec![token, hidden])?;
        let cache = outputs.split_off(1);
        let logits = first(ModelStage::DecoderPrefill, outputs)?;

        let next = self.selector.select(&logits)?;
        self.cache.seed(cache)?;
        self.tokens.push(next);
        debug!("prefill -> token {}", next);

        if !self.finish_if_done(next) {
            self.transition(SessionState::Incrementing);
        }
        Ok(())
    }

    fn increment(&mut self) -> Result<u32> {
        let last = self.tokens[self.tokens.len() - 1];

        let mut inputs = Vec::with_capacity(1 + self.cache.len());
        inputs.push(token_tensor(last, &self.device)?);
        inputs.extend(self.cache.snapshot());

        let mut outputs = self.invoke(ModelStage::DecoderIncremental, inputs)?;
        let self_attention = outputs.split_off(1);
        let logits = first(ModelStage::DecoderIncremental, outputs)?;

        let next = self.selector.select(&logits)?;
        self.cache.replace_self_attention(self_attention)?;
        self.tokens.push(next);
        self.steps += 1;
        debug!(
            "step {} -> token {} (cache length {})",
            self.steps,
            next,
            self.cache.decoder_len()
        );

        self.finish_if_done(next);
        Ok(next)
    }

    /// Terminate on end-of-sequence or once `max_length` tokens exist
    fn finish_if_done(&mut self, token: u32) -> bool {
        let reason = if token == self.config.eos_token {
            StopReason::EndOfSequence
        } else if self.tokens.len() - 1 >= self.config.max_length {
            StopReason::MaxLength
        } else {
            return false;
        };
        self.stop_reason = Some(reason);
        self.transition(SessionState::Terminated);
        true
    }
}

fn first(stage: ModelStage, outputs: Vec<Tensor>) -> Result<Tensor> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| DecodeError::MalformedOutput {
            stage,
            reason: "no outputs".to_string(),
        })
}

fn check_shape(what: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(DecodeError::ShapeMismatch {
            slot: what.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiny_config(max_length: usize) -> DecoderConfig {
        DecoderConfig {
            cache: CacheConfig {
                num_layers: 1,
                num_heads: 2,
                head_dim: 3,
                encoder_seq_len: 4,
                dtype: DType::F32,
            },
            hidden_dim: 5,
            num_mel_bins: 2,
            num_frames: 8,
            start_token: 7,
            eos_token: 0,
            max_length,
        }
    }

    fn one_hot(token: usize, vocab: usize) -> Tensor {
        let mut v = vec![0f32; vocab];
        v[token] = 1.0;
        Tensor::from_vec(v, (1, 1, vocab), &Device::Cpu).unwrap()
    }

    fn encoder(_: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        Ok(vec![Tensor::zeros((1, 4, 5), DType::F32, &Device::Cpu)?])
    }

    fn prefill_emitting(token: usize) -> impl Fn(&[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        move |_: &[Tensor]| -> candle_core::Result<Vec<Tensor>> {
            Ok(vec![
                one_hot(token, 10),
                Tensor::ones((1, 2, 1, 3), DType::F32, &Device::Cpu)?,
                Tensor::ones((1, 2, 1, 3), DType::F32, &Device::Cpu)?,
                Tensor::full(2f32, (1, 2, 4, 3), &Device::Cpu)?,
                Tensor::full(3f32, (1, 2, 4, 3), &Device::Cpu)?,
            ])
        }
    }

    fn features() -> Tensor {
        Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_config_matches_whisper_tiny() {
        let config = DecoderConfig::default();
        assert_eq!(config.cache.num_layers, 4);
        assert_eq!(config.hidden_shape(), [1, 1500, 384]);
        assert_eq!(config.feature_shape(), [1, 80, 3000]);
        assert_eq!(config.start_token, 50258);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_rejects_zero_hidden_dim() {
        let calls = AtomicUsize::new(0);
        let counting = |_: &[Tensor]| -> candle_core::Result<Vec<Tensor>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        };
        let stages = StageSet::new(&counting, &counting, &counting);
        let config = DecoderConfig {
            hidden_dim: 0,
            ..tiny_config(4)
        };
        let err = DecodingSession::new(config, stages, &Device::Cpu).err().unwrap();
        assert!(matches!(err, DecodeError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_max_length_is_rejected() {
        let prefill = prefill_emitting(3);
        let stages = StageSet::new(&encoder, &prefill, &encoder);
        let err = DecodingSession::new(tiny_config(0), stages, &Device::Cpu).err().unwrap();
        assert!(matches!(err, DecodeError::Configuration(_)));
        assert!(tiny_config(1).validate().is_ok());
    }

    #[test]
    fn test_step_before_begin_is_rejected() {
        let prefill = prefill_emitting(3);
        let stages = StageSet::new(&encoder, &prefill, &encoder);
        let mut session = DecodingSession::new(tiny_config(4), stages, &Device::Cpu).unwrap();
        assert!(matches!(
            session.step(),
            Err(DecodeError::InvalidState { operation: "step", .. })
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_max_length_one_stops_after_prefill() {
        let prefill = prefill_emitting(3);
        let incremental = |_: &[Tensor]| -> candle_core::Result<Vec<Tensor>> {
            candle_core::bail!("incremental stage must not run")
        };
        let stages = StageSet::new(&encoder, &prefill, &incremental);
        let mut session = DecodingSession::new(tiny_config(1), stages, &Device::Cpu).unwrap();

        let tokens = session.start(&features()).unwrap();
        assert_eq!(tokens, vec![7, 3]);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.stop_reason(), Some(StopReason::MaxLength));
        assert_eq!(session.steps_taken(), 0);
        assert!(session.cache().is_seeded());
    }

    #[test]
    fn test_wrong_feature_shape_aborts_before_encoder() {
        let calls = AtomicUsize::new(0);
        let counting_encoder = |inputs: &[Tensor]| -> candle_core::Result<Vec<Tensor>> {
            calls.fetch_add(1, Ordering::SeqCst);
            encoder(inputs)
        };
        let prefill = prefill_emitting(3);
        let stages = StageSet::new(&counting_encoder, &prefill, &encoder);
        let mut session = DecodingSession::new(tiny_config(4), stages, &Device::Cpu).unwrap();

        let bad = Tensor::zeros((1, 3, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            session.start(&bad),
            Err(DecodeError::ShapeMismatch { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_wrong_hidden_shape_aborts() {
        let wide_encoder = |_: &[Tensor]| -> candle_core::Result<Vec<Tensor>> {
            Ok(vec![Tensor::zeros((1, 4, 6), DType::F32, &Device::Cpu)?])
        };
        let prefill = prefill_emitting(3);
        let stages = StageSet::new(&wide_encoder, &prefill, &encoder);
        let mut session = DecodingSession::new(tiny_config(4), stages, &Device::Cpu).unwrap();
        assert!(session.start(&features()).is_err());
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(session.tokens(), &[7]);
    }

    #[test]
    fn test_terminated_session_is_absorbing() {
        let prefill = prefill_emitting(0);
        let stages = StageSet::new(&encoder, &prefill, &encoder);
        let mut session = DecodingSession::new(tiny_config(4), stages, &Device::Cpu).unwrap();
        session.start(&features()).unwrap();
        assert_eq!(session.stop_reason(), Some(StopReason::EndOfSequence));

        assert!(matches!(
            session.begin(&features()),
            Err(DecodeError::InvalidState { .. })
        ));
        assert!(session.step().is_err());
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.generated(), &[0]);
    }
}
