//! # Extern Data
//!
//! Declares the named data streams a network consumes and produces, and binds
//! them to dataset keys.

use std::collections::BTreeMap;

use candle_core::DType;
use serde::Deserialize;

use crate::config::Config;
use crate::data::dataset::Dataset;
use crate::error::{KairoError, Result};

/// Default key of the input stream.
pub const DEFAULT_INPUT_KEY: &str = "data";
/// Default key of the label stream.
pub const DEFAULT_TARGET_KEY: &str = "classes";

/// Shape/dtype contract of one data stream or layer output.
///
/// Dense data has the layout `(batch, [time,] dim)` with a float dtype;
/// sparse data holds class indices with layout `(batch, [time])` and `dim`
/// is the number of classes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSpec {
    /// Stream or layer name.
    pub name: String,
    /// Feature dimension, or number of classes when sparse.
    pub dim: usize,
    /// Whether values are class indices.
    pub sparse: bool,
    /// Element type.
    pub dtype: DType,
    /// Whether the layout has a dynamic time axis.
    pub time_axis: bool,
    /// Fill value for frames beyond a sequence's true length.
    pub pad_value: f32,
}

impl DataSpec {
    /// Dense `f32` stream with a time axis.
    pub fn dense(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            sparse: false,
            dtype: DType::F32,
            time_axis: true,
            pad_value: 0.0,
        }
    }

    /// Sparse `u32` class-index stream with a time axis.
    pub fn sparse(name: impl Into<String>, num_classes: usize) -> Self {
        Self {
            name: name.into(),
            dim: num_classes,
            sparse: true,
            dtype: DType::U32,
            time_axis: true,
            pad_value: 0.0,
        }
    }

    /// Same spec under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Removes the time axis (single step inside a recurrent unit).
    pub fn without_time(mut self) -> Self {
        self.time_axis = false;
        self
    }

    /// Adds a time axis (outputs stacked over steps).
    pub fn with_time(mut self) -> Self {
        self.time_axis = true;
        self
    }

    /// Sets the element type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Sets the pad value.
    pub fn with_pad_value(mut self, pad_value: f32) -> Self {
        self.pad_value = pad_value;
        self
    }

    /// Sparse streams pad with a class index, so their pad value must be a
    /// non-negative integer.
    pub fn validate(&self) -> Result<()> {
        let pad = self.pad_value;
        if self.sparse && !(pad >= 0.0 && pad.fract() == 0.0 && pad <= u32::MAX as f32) {
            return Err(KairoError::config(format!(
                "sparse stream {:?}: pad value {pad} is not a class index",
                self.name
            )));
        }
        Ok(())
    }

    /// Trailing feature shape: `[]` for sparse, `[dim]` for dense.
    pub fn feature_shape(&self) -> Vec<usize> {
        if self.sparse { Vec::new() } else { vec![self.dim] }
    }
}

/// Parses a dtype name as used in network and extern data definitions.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "float32" | "f32" => Ok(DType::F32),
        "float64" | "f64" => Ok(DType::F64),
        "int32" | "int64" | "i64" => Ok(DType::I64),
        "uint32" | "u32" => Ok(DType::U32),
        "bool" | "uint8" | "u8" => Ok(DType::U8),
        other => Err(KairoError::config(format!("unknown dtype {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
struct ExternDataEntry {
    dim: usize,
    #[serde(default)]
    sparse: bool,
    #[serde(default)]
    dtype: Option<String>,
    #[serde(default)]
    pad_value: Option<f32>,
}

/// The set of data streams bound to a network.
#[derive(Debug, Clone, Default)]
pub struct ExternData {
    data: BTreeMap<String, DataSpec>,
}

impl ExternData {
    /// Creates an empty binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a stream.
    pub fn register(&mut self, spec: DataSpec) {
        self.data.insert(spec.name.clone(), spec);
    }

    /// Declares every stream the dataset provides.
    pub fn init_from_dataset(&mut self, dataset: &dyn Dataset) -> Result<()> {
        for key in dataset.data_keys() {
            let spec = dataset.data_spec(&key).ok_or_else(|| {
                KairoError::data(format!("dataset lists key {key:?} without a spec"))
            })?;
            self.register(spec);
        }
        Ok(())
    }

    /// Declares streams from `num_inputs`/`num_outputs` and, when present,
    /// the JSON object under `extern_data`.
    pub fn init_from_config(&mut self, config: &Config) -> Result<()> {
        if config.has("num_inputs") {
            self.register(DataSpec::dense(
                DEFAULT_INPUT_KEY,
                config.usize("num_inputs", 0)?,
            ));
        }
        if config.has("num_outputs") {
            self.register(DataSpec::sparse(
                DEFAULT_TARGET_KEY,
                config.usize("num_outputs", 0)?,
            ));
        }
        if let Some(json) = config.value_opt("extern_data") {
            let entries: BTreeMap<String, ExternDataEntry> = serde_json::from_str(&json)?;
            for (name, entry) in entries {
                let mut spec = if entry.sparse {
                    DataSpec::sparse(&name, entry.dim)
                } else {
                    DataSpec::dense(&name, entry.dim)
                };
                if let Some(dtype) = entry.dtype.as_deref() {
                    spec = spec.with_dtype(parse_dtype(dtype)?);
                }
                if let Some(pad) = entry.pad_value {
                    spec = spec.with_pad_value(pad);
                }
                spec.validate()?;
                self.register(spec);
            }
        }
        Ok(())
    }

    /// Looks up a stream.
    pub fn get(&self, key: &str) -> Result<&DataSpec> {
        self.data
            .get(key)
            .ok_or_else(|| KairoError::config(format!("unknown extern data key {key:?}")))
    }

    /// Whether the stream is declared.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// All declared keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    /// Verifies that the dataset provides every declared stream with a
    /// matching dimension.
    pub fn check_dataset(&self, dataset: &dyn Dataset) -> Result<()> {
        for (key, spec) in &self.data {
            let provided = dataset.data_spec(key).ok_or_else(|| {
                KairoError::data(format!("dataset does not provide required stream {key:?}"))
            })?;
            if provided.dim != spec.dim || provided.sparse != spec.sparse {
                return Err(KairoError::data(format!(
                    "stream {key:?}: dataset has dim {} (sparse: {}), network expects dim {} (sparse: {})",
                    provided.dim, provided.sparse, spec.dim, spec.sparse
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::DummyDataset;

    #[test]
    fn init_from_config_declares_defaults() {
        let mut config = Config::new();
        config.set("num_inputs", 2);
        config.set("num_outputs", 3);
        let mut extern_data = ExternData::new();
        extern_data.init_from_config(&config).unwrap();

        let data = extern_data.get("data").unwrap();
        assert_eq!(data.dim, 2);
        assert!(!data.sparse);
        let classes = extern_data.get("classes").unwrap();
        assert_eq!(classes.dim, 3);
        assert!(classes.sparse);
        assert_eq!(classes.dtype, DType::U32);
    }

    #[test]
    fn init_from_config_json() {
        let mut config = Config::new();
        config.set(
            "extern_data",
            r#"{"feats": {"dim": 4, "pad_value": -1.0}, "labels": {"dim": 7, "sparse": true}}"#,
        );
        let mut extern_data = ExternData::new();
        extern_data.init_from_config(&config).unwrap();
        assert_eq!(extern_data.get("feats").unwrap().pad_value, -1.0);
        assert_eq!(extern_data.get("labels").unwrap().dim, 7);
        assert_eq!(extern_data.keys(), vec!["feats".to_string(), "labels".to_string()]);
    }

    #[test]
    fn sparse_pad_value_must_be_a_class_index() {
        for pad in ["-1", "0.5"] {
            let mut config = Config::new();
            config.set(
                "extern_data",
                format!(r#"{{"labels": {{"dim": 7, "sparse": true, "pad_value": {pad}}}}}"#),
            );
            let err = ExternData::new().init_from_config(&config).unwrap_err();
            assert!(matches!(err, KairoError::Config(_)), "pad {pad}");
        }

        let mut config = Config::new();
        config.set("extern_data", r#"{"labels": {"dim": 7, "sparse": true, "pad_value": 6}}"#);
        let mut extern_data = ExternData::new();
        extern_data.init_from_config(&config).unwrap();
        assert_eq!(extern_data.get("labels").unwrap().pad_value, 6.0);
    }

    #[test]
    fn check_dataset_reports_missing_stream() {
        let dataset = DummyDataset::new(2, 3, 2, 5);
        let mut extern_data = ExternData::new();
        extern_data.init_from_dataset(&dataset).unwrap();
        assert!(extern_data.check_dataset(&dataset).is_ok());

        extern_data.register(DataSpec::dense("speaker", 8));
        let err = extern_data.check_dataset(&dataset).unwrap_err();
        assert!(matches!(err, KairoError::Data(_)));
    }

    #[test]
    fn unknown_dtype_is_config_error() {
        assert!(parse_dtype("int32").is_ok());
        assert!(matches!(parse_dtype("complex"), Err(KairoError::Config(_))));
    }
}
