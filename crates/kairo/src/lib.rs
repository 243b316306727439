//! # Kairo
//!
//! Sequence-model training toolkit. Re-exports the data and network layer
//! from [`kairo_core`] and the training engine from [`kairo_engine`].

pub use kairo_core::*;
pub use kairo_engine::{
    AnalyzeStats, Checkpoint, Engine, EngineState, EpochData, LearningRateControl, LrPolicy,
    ScoreSums, SearchHypothesis, Updater, open_dataset,
};

pub mod engine {
    pub use kairo_engine::*;
}
