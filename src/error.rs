//! Error taxonomy of the decoding engine
//!
//! Every variant aborts the session that raised it. Reaching the
//! end-of-sequence token is a normal stop and never surfaces here.

use candle_core::DType;
use thiserror::Error;

use crate::decoding::{ModelStage, SessionState};

/// Errors raised by the cache bank, the stage wrappers and the session
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Invalid layer/head/dimension counts, raised before any stage call
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A tensor disagrees with the configured cache or stage dimensions
    #[error("Shape mismatch for {slot}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Slot or tensor being checked
        slot: String,
        /// Dimensions the configuration requires
        expected: Vec<usize>,
        /// Dimensions the tensor has
        actual: Vec<usize>,
    },

    /// A cache tensor has a different element type than the bank
    #[error("Dtype mismatch for {slot}: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        /// Slot being checked
        slot: String,
        /// Element type of the bank
        expected: DType,
        /// Element type of the tensor
        actual: DType,
    },

    /// The cross-attention slots were already populated for this session
    #[error("Cross-attention cache is already populated")]
    CrossAttentionSealed,

    /// A stage returned something that violates its output contract
    #[error("Malformed output from {stage}: {reason}")]
    MalformedOutput {
        /// Stage that produced the output
        stage: ModelStage,
        /// What was wrong with it
        reason: String,
    },

    /// The compiled callable itself failed
    #[error("{stage} invocation failed")]
    StageInvocation {
        /// Stage whose callable failed
        stage: ModelStage,
        /// Error returned by the callable
        #[source]
        source: candle_core::Error,
    },

    /// A session operation was requested in a state that does not allow it
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        /// Requested operation
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },

    /// Logits handed to the token selector have no usable distribution
    #[error("Malformed logits with shape {dims:?}: {reason}")]
    MalformedLogits {
        /// Shape of the logits tensor
        dims: Vec<usize>,
        /// What was wrong with it
        reason: String,
    },

    /// A tensor operation inside the engine failed
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result alias used throughout the decoding engine
pub type Result<T> = std::result::Result<T, DecodeError>;
