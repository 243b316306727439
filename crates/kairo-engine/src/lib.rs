//! # Kairo Engine
//!
//! Runs kairo networks: the epoch loop with optimizer updates, learning-rate
//! control and resumable checkpoints, plus forwarding and beam search over
//! whole datasets.
//!
//! ## Quick Start
//!
//! ```rust
//! use kairo_core::{Config, DummyDataset};
//! use kairo_engine::Engine;
//!
//! let mut config = Config::new();
//! config.set("num_epochs", 2);
//! config.set("batch_size", 10);
//! config.set("learning_rate", 0.1);
//! config.set_network_json(r#"{"output": {"class": "softmax", "loss": "ce"}}"#);
//!
//! let mut train = DummyDataset::new(2, 3, 4, 5);
//! let mut engine = Engine::new(config).unwrap();
//! engine.init_train_from_config(&train, None).unwrap();
//! engine.train(&mut train, None).unwrap();
//! assert_eq!(engine.epoch(), 2);
//! ```

pub mod checkpoint;
pub mod engine;
pub mod inference;
pub mod lr_control;
pub mod source;
pub mod updater;

pub use checkpoint::Checkpoint;
pub use engine::{Engine, EngineState, ScoreSums};
pub use inference::{AnalyzeStats, SearchHypothesis};
pub use lr_control::{EpochData, LearningRateControl, LrPolicy};
pub use source::open_dataset;
pub use updater::{Gradients, Updater};
