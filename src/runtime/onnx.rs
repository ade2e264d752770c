//! ONNX graph execution via candle-onnx
//!
//! A graph's positional contract is the order of its declared inputs
//! (initializers excluded) and outputs. Loading checks that order against
//! the arity the stage must have for the configured layout.

use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_onnx::onnx::ModelProto;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::config::ModelConfig;
use crate::decoding::{ModelStage, SlotLayout, StageRunner, StageSet};

/// One compiled stage loaded from an `.onnx` file
pub struct OnnxStage {
    stage: ModelStage,
    model: ModelProto,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OnnxStage {
    /// Load a graph and check its declared inputs and outputs against
    /// `stage` under `layout`
    pub fn load<P: AsRef<Path>>(path: P, stage: ModelStage, layout: &SlotLayout) -> Result<Self> {
        let path = path.as_ref();
        let model = candle_onnx::read_file(path)
            .with_context(|| format!("Failed to read {} graph {:?}", stage, path))?;
        let graph = model
            .graph
            .as_ref()
            .with_context(|| format!("No graph in {:?}", path))?;

        let initializers: HashSet<&str> =
            graph.initializer.iter().map(|t| t.name.as_str()).collect();
        let inputs: Vec<String> = graph
            .input
            .iter()
            .filter(|i| !initializers.contains(i.name.as_str()))
            .map(|i| i.name.clone())
            .collect();
        let outputs: Vec<String> = graph.output.iter().map(|o| o.name.clone()).collect();

        if inputs.len() != stage.input_arity(layout) {
            anyhow::bail!(
                "{} graph {:?} declares {} inputs, expected {}",
                stage,
                path,
                inputs.len(),
                stage.input_arity(layout)
            );
        }
        if outputs.len() != stage.output_arity(layout) {
            anyhow::bail!(
                "{} graph {:?} declares {} outputs, expected {}",
                stage,
                path,
                outputs.len(),
                stage.output_arity(layout)
            );
        }

        info!(
            "Loaded {} from {:?} ({} inputs, {} outputs)",
            stage,
            path,
            inputs.len(),
            outputs.len()
        );

        Ok(Self {
            stage,
            model,
            inputs,
            outputs,
        })
    }

    /// Stage this graph implements
    pub fn stage(&self) -> ModelStage {
        self.stage
    }

    /// Declared input names, in positional order
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output names, in positional order
    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }
}

impl StageRunner for OnnxStage {
    fn run(&self, inputs: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
        if inputs.len() != self.inputs.len() {
            candle_core::bail!(
                "{} expects {} inputs, got {}",
                self.stage,
                self.inputs.len(),
                inputs.len()
            );
        }
        let feed: HashMap<String, Tensor> = self
            .inputs
            .iter()
            .cloned()
            .zip(inputs.iter().cloned())
            .collect();

        let mut results = candle_onnx::simple_eval(&self.model, feed)?;
        self.outputs
            .iter()
            .map(|name| {
                results.remove(name).ok_or_else(|| {
                    candle_core::Error::Msg(format!("{} produced no output '{}'", self.stage, name))
                })
            })
            .collect()
    }
}

/// The three graphs of one model
pub struct OnnxStages {
    /// Encoder graph
    pub encoder: OnnxStage,
    /// Decoder graph without past key/values
    pub prefill: OnnxStage,
    /// Decoder graph with past key/values
    pub incremental: OnnxStage,
}

impl OnnxStages {
    /// Load every artifact named in the config
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let layout = SlotLayout::new(config.model.num_layers)?;
        let artifacts = &config.artifacts;
        Ok(Self {
            encoder: OnnxStage::load(&artifacts.encoder, ModelStage::Encoder, &layout)?,
            prefill: OnnxStage::load(&artifacts.decoder_prefill, ModelStage::DecoderPrefill, &layout)?,
            incremental: OnnxStage::load(
                &artifacts.decoder_incremental,
                ModelStage::DecoderIncremental,
                &layout,
            )?,
        })
    }

    /// Borrow as a stage set for a session
    pub fn as_stage_set(&self) -> StageSet<'_> {
        StageSet::new(&self.encoder, &self.prefill, &self.incremental)
    }
}
