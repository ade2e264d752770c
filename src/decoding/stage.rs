//! Compiled stage contracts
//!
//! A model is split into three separately compiled callables. Each one is a
//! stateless function over a fixed number of tensors; the arity is a
//! property of the stage, checked on every call.
//!
//! | stage               | inputs                    | outputs                 |
//! |---------------------|---------------------------|-------------------------|
//! | Encoder             | features                  | hidden state            |
//! | DecoderPrefill      | token, hidden state       | logits + `4L` cache     |
//! | DecoderIncremental  | token + `4L` cache        | logits + `2L` self cache|

use candle_core::{DType, Device, Tensor};
use std::fmt;
use std::time::Instant;
use tracing::debug;

use super::cache::SlotLayout;
use super::profile::StageProfiler;
use crate::error::{DecodeError, Result};

/// An opaque compiled callable (the artifact's `main` entry)
pub trait StageRunner: Send + Sync {
    /// Run the callable on positional inputs and return positional outputs
    fn run(&self, inputs: &[Tensor]) -> candle_core::Result<Vec<Tensor>>;
}

impl<F> StageRunner for F
where
    F: Fn(&[Tensor]) -> candle_core::Result<Vec<Tensor>> + Send + Sync,
{
    fn run(&self, inputs: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        self(inputs)
    }
}

/// The three stages of a staged encoder-decoder model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelStage {
    /// Runs once per input, produces the encoder hidden state
    Encoder,
    /// First decoder call: start token + hidden state, produces the cache
    DecoderPrefill,
    /// One decoder call per generated token after prefill
    DecoderIncremental,
}

impl ModelStage {
    /// All stages in execution order
    pub const ALL: [ModelStage; 3] = [
        ModelStage::Encoder,
        ModelStage::DecoderPrefill,
        ModelStage::DecoderIncremental,
    ];

    /// Short name used in logs and profiles
    pub fn name(self) -> &'static str {
        match self {
            ModelStage::Encoder => "encoder",
            ModelStage::DecoderPrefill => "decoder_prefill",
            ModelStage::DecoderIncremental => "decoder_incremental",
        }
    }

    /// Number of tensors the stage consumes
    pub fn input_arity(self, layout: &SlotLayout) -> usize {
        match self {
            ModelStage::Encoder => 1,
            ModelStage::DecoderPrefill => 2,
            ModelStage::DecoderIncremental => 1 + layout.num_slots(),
        }
    }

    /// Number of tensors the stage returns
    pub fn output_arity(self, layout: &SlotLayout) -> usize {
        match self {
            ModelStage::Encoder => 1,
            ModelStage::DecoderPrefill => 1 + layout.num_slots(),
            ModelStage::DecoderIncremental => 1 + layout.num_self_slots(),
        }
    }

    /// Whether the first output is a logits tensor
    pub fn emits_logits(self) -> bool {
        !matches!(self, ModelStage::Encoder)
    }

    /// Call `runner` with arity checks, timing and optional profiling
    pub(crate) fn invoke<'p>(
        self,
        runner: &dyn StageRunner,
        inputs: Vec<Tensor>,
        layout: &SlotLayout,
        profiler: Option<&mut (dyn StageProfiler + 'p)>,
    ) -> Result<Vec<Tensor>> {
        debug_assert_eq!(inputs.len(), self.input_arity(layout));

        let started = Instant::now();
        let outputs = runner
            .run(&inputs)
            .map_err(|source| DecodeError::StageInvocation {
                stage: self,
                source,
            })?;
        let elapsed = started.elapsed();
        debug!("{} finished in {:.2}ms", self, elapsed.as_secs_f64() * 1000.0);

        if let Some(profiler) = profiler {
            profiler.record(self, elapsed);
        }

        let expected = self.output_arity(layout);
        if outputs.len() != expected {
            return Err(DecodeError::MalformedOutput {
                stage: self,
                reason: format!("expected {} outputs, got {}", expected, outputs.len()),
            });
        }
        if self.emits_logits() {
            check_logits(self, &outputs[0])?;
        }
        Ok(outputs)
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logits must be `(1, vocab)` or `(1, seq, vocab)`
fn check_logits(stage: ModelStage, logits: &Tensor) -> Result<()> {
    let rank = logits.rank();
    if rank != 2 && rank != 3 {
        return Err(DecodeError::MalformedOutput {
            stage,
            reason: format!(
                "logits must have rank 2 or 3, got rank {} ({:?})",
                rank,
                logits.dims()
            ),
        });
    }
    Ok(())
}

/// The three callables of one model, borrowed from their owner
#[derive(Clone, Copy)]
pub struct StageSet<'a> {
    encoder: &'a dyn StageRunner,
    prefill: &'a dyn StageRunner,
    incremental: &'a dyn StageRunner,
}

impl<'a> StageSet<'a> {
    /// Bundle the encoder, prefill and incremental callables
    pub fn new(
        encoder: &'a dyn StageRunner,
        prefill: &'a dyn StageRunner,
        incremental: &'a dyn StageRunner,
    ) -> Self {
        Self {
            encoder,
            prefill,
            incremental,
        }
    }

    /// Callable backing `stage`
    pub fn runner(&self, stage: ModelStage) -> &'a dyn StageRunner {
        match stage {
            ModelStage::Encoder => self.encoder,
            ModelStage::DecoderPrefill => self.prefill,
            ModelStage::DecoderIncremental => self.incremental,
        }
    }
}

impl fmt::Debug for StageSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet").finish_non_exhaustive()
    }
}

/// Decoder token input: shape `(1, 1)`, int64
pub fn token_tensor(token: u32, device: &Device) -> Result<Tensor> {
    let t = Tensor::new(&[[token as i64]], device)?;
    debug_assert_eq!(t.dtype(), DType::I64);
    Ok(t)
}
