use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building, feeding or running a network.
#[derive(Debug, Error)]
pub enum KairoError {
    /// Malformed configuration, unresolvable layer reference, dependency
    /// cycle or shape/dtype mismatch detected at build time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset content that cannot be batched or fed.
    #[error("data error: {0}")]
    Data(String),

    /// A non-finite loss or gradient. Fatal for the run.
    #[error(
        "non-finite value {value} in epoch {epoch}, batch {batch} (layers: {layers:?}, seqs: {seq_tags:?})"
    )]
    Numerical {
        /// Epoch in which the value was observed.
        epoch: usize,
        /// Batch index within the epoch.
        batch: usize,
        /// Layers contributing to the offending objective.
        layers: Vec<String>,
        /// Tags of the sequences in the batch.
        seq_tags: Vec<String>,
        /// The offending value.
        value: f64,
    },

    /// File-system failure with the path involved.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Operation is not valid in the current engine state.
    #[error("invalid state: {0}")]
    State(String),

    /// Candle tensor runtime error.
    #[error("tensor runtime error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Safetensors container error.
    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON (network topology or persisted state) error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KairoError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for kairo operations.
pub type Result<T> = std::result::Result<T, KairoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = KairoError::config("unknown layer class \"foo\"");
        assert!(err.to_string().starts_with("configuration error"));
        assert!(err.to_string().contains("foo"));

        let err = KairoError::Numerical {
            epoch: 3,
            batch: 7,
            layers: vec!["output".into()],
            seq_tags: vec!["seq-0".into()],
            value: f64::NAN,
        };
        let msg = err.to_string();
        assert!(msg.contains("epoch 3"));
        assert!(msg.contains("batch 7"));
        assert!(msg.contains("output"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KairoError>();
    }
}
