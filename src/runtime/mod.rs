//! Stage runtimes
//!
//! Compiled stage artifacts are executed through [`crate::decoding::StageRunner`].
//! The ONNX backend is available with the `onnx` feature.

#[cfg(feature = "onnx")]
mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxStage, OnnxStages};
