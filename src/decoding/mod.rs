//! Staged greedy decoding engine
//!
//! - Cache bank with an explicit per-layer slot layout
//! - Encoder / prefill / incremental stage contracts
//! - Greedy token selection
//! - Session state machine tying them together
//! - Optional stage profiling

mod cache;
mod profile;
mod selector;
mod session;
mod stage;

pub use cache::{CacheBank, CacheConfig, SlotKind, SlotLayout};
pub use profile::{StageProfiler, StageStat, StageTimings};
pub use selector::{argmax, TokenSelector};
pub use session::{DecoderConfig, DecodingSession, SessionState, StopReason};
pub use stage::{token_tensor, ModelStage, StageRunner, StageSet};
