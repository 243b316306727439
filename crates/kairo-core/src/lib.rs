//! # Kairo Core
//!
//! Building blocks for training sequence models: datasets and dynamic batch
//! assembly, a background data feeder, and a network graph with recurrent
//! subnetworks and beam search.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::Device;
//! use kairo_core::data::{BatchSetGenerator, BatchingConfig, Dataset, DummyDataset, ExternData, FeedBuilder};
//! use kairo_core::network::{LayerRegistry, Network, ParamStore, RunMode};
//! use serde_json::json;
//!
//! let mut dataset = DummyDataset::new(3, 2, 4, 5);
//! dataset.init_seq_order(1).unwrap();
//! let mut extern_data = ExternData::new();
//! extern_data.init_from_dataset(&dataset).unwrap();
//!
//! let net = json!({"output": {"class": "softmax", "loss": "ce"}});
//! let mut params = ParamStore::new(42, Device::Cpu);
//! let network = Network::build(&net, &extern_data, &LayerRegistry::with_builtin(), &mut params).unwrap();
//!
//! let config = BatchingConfig { batch_size: 10, ..BatchingConfig::default() };
//! let feeder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
//! for batch in BatchSetGenerator::new(&dataset, config).unwrap() {
//!     let feed = feeder.build(&batch.unwrap()).unwrap();
//!     let outputs = network.forward(&feed, RunMode::Eval, 0).unwrap();
//!     assert!(outputs.loss().unwrap().to_scalar::<f32>().unwrap() > 0.0);
//! }
//! ```
pub mod config;
pub mod data;
pub mod error;
pub mod network;

// Re-export primary API
pub use config::Config;
pub use data::{
    Batch, BatchSetGenerator, BatchingConfig, DataProvider, DataSpec, Dataset, DummyDataset,
    ExternData, FeedBuilder, FeedDict, FileDataset,
};
pub use error::{KairoError, Result};
pub use network::{LayerRegistry, Network, ParamStore, RunMode, RunOutputs};
