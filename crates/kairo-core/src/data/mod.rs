//! Datasets, batch assembly, extern data binding and feeding.

pub mod batch;
pub mod dataset;
pub mod extern_data;
pub mod feeder;
pub mod file;

pub use batch::{Batch, BatchSetGenerator, BatchSlot, BatchingConfig, SeqSpan};
pub use dataset::{Dataset, DummyDataset, Frames, SeqOrdering, SeqRecord, StaticDataset};
pub use extern_data::{
    DEFAULT_INPUT_KEY, DEFAULT_TARGET_KEY, DataSpec, ExternData, parse_dtype,
};
pub use feeder::{DataProvider, FeedBuilder, FeedDict, FeedTensor};
pub use file::{DatasetFileWriter, FileDataset, write_atomic};
