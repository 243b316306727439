//! # Configuration
//!
//! Flat key/value configuration. Every key maps to one or more string values;
//! typed accessors parse on read and fail loudly on malformed values instead
//! of silently falling back to the default.
//!
//! File syntax, one entry per line:
//!
//! ```text
//! # comment
//! batch_size 5000
//! chunking   50:25
//! network    {"output": {"class": "softmax", "loss": "ce"}}
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use crate::error::{KairoError, Result};

/// Flat key → values configuration store.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: BTreeMap<String, Vec<String>>,
    network_topology_json: Option<String>,
}

impl Config {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads all entries of a config file, overwriting duplicate keys.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| KairoError::io(path, e))?;
        self.load_str(&content)
            .map_err(|e| KairoError::config(format!("{}: {e}", path.display())))
    }

    /// Parses config file content.
    pub fn load_str(&mut self, content: &str) -> Result<()> {
        for (lineno, raw) in content.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().map(str::trim).unwrap_or_default();
            if value.is_empty() {
                return Err(KairoError::config(format!(
                    "unable to parse config line {}: {raw:?}",
                    lineno + 1
                )));
            }
            self.add_line(key, value);
        }
        Ok(())
    }

    /// Adds one `key value` entry. A comma after the first character splits
    /// the value into a list.
    pub fn add_line(&mut self, key: &str, value: &str) {
        let values = match value.find(',') {
            Some(pos) if pos > 0 => value.split(',').map(str::to_string).collect(),
            _ => vec![value.to_string()],
        };
        self.entries.insert(key.to_string(), values);
    }

    /// Whether the key is set.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Sets a single value, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Display) {
        self.entries.insert(key.to_string(), vec![value.to_string()]);
    }

    /// Sets a list value.
    pub fn set_list<T: Display>(&mut self, key: &str, values: &[T]) {
        self.entries
            .insert(key.to_string(), values.iter().map(ToString::to_string).collect());
    }

    /// Sets the network topology explicitly, taking precedence over the
    /// `network` key.
    pub fn set_network_json(&mut self, json: impl Into<String>) {
        self.network_topology_json = Some(json.into());
    }

    /// The network topology JSON, if any.
    pub fn network_json(&self) -> Option<String> {
        self.network_topology_json
            .clone()
            .or_else(|| self.value_opt("network"))
    }

    /// Raw values of a key joined with commas.
    pub fn value_opt(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.join(","))
    }

    /// Raw value joined with commas, or the default.
    pub fn value(&self, key: &str, default: &str) -> String {
        self.value_opt(key).unwrap_or_else(|| default.to_string())
    }

    fn indexed(&self, key: &str, index: usize) -> Result<Option<&str>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(values) => values.get(index).map(|v| Some(v.trim())).ok_or_else(|| {
                KairoError::config(format!(
                    "config key {key:?} has {} values, index {index} requested",
                    values.len()
                ))
            }),
        }
    }

    /// Integer value at index 0.
    pub fn int(&self, key: &str, default: i64) -> Result<i64> {
        self.int_at(key, default, 0)
    }

    /// Integer value at the given list index.
    pub fn int_at(&self, key: &str, default: i64, index: usize) -> Result<i64> {
        match self.indexed(key, index)? {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| KairoError::config(format!("invalid int value for {key}: {v:?}"))),
        }
    }

    /// Non-negative integer value, convenient for sizes and counts.
    pub fn usize(&self, key: &str, default: usize) -> Result<usize> {
        let v = self.int(key, default as i64)?;
        usize::try_from(v)
            .map_err(|_| KairoError::config(format!("{key} must be non-negative, got {v}")))
    }

    /// Float value at index 0.
    pub fn float(&self, key: &str, default: f64) -> Result<f64> {
        match self.indexed(key, 0)? {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| KairoError::config(format!("invalid float value for {key}: {v:?}"))),
        }
    }

    /// Boolean value; accepts `true`/`false`/`1`/`0` in any case. An empty
    /// value yields the default.
    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.indexed(key, 0)? {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                "" => Ok(default),
                _ => Err(KairoError::config(format!(
                    "invalid bool value for {key}: {v:?}"
                ))),
            },
        }
    }

    /// All values of a key.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// All values of a key parsed as integers.
    pub fn int_list(&self, key: &str) -> Result<Vec<i64>> {
        self.list(key)
            .iter()
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| KairoError::config(format!("invalid int in {key}: {v:?}")))
            })
            .collect()
    }

    /// All values of a key parsed as floats.
    pub fn float_list(&self, key: &str) -> Result<Vec<f64>> {
        self.list(key)
            .iter()
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| KairoError::config(format!("invalid float in {key}: {v:?}")))
            })
            .collect()
    }

    /// `a:b` pair, or `a` meaning `(a, a)`.
    pub fn int_pair(&self, key: &str, default: (i64, i64)) -> Result<(i64, i64)> {
        let Some(value) = self.value_opt(key) else {
            return Ok(default);
        };
        let parse = |s: &str| -> Result<i64> {
            s.trim()
                .parse()
                .map_err(|_| KairoError::config(format!("invalid int pair for {key}: {value:?}")))
        };
        match value.split_once(':') {
            Some((a, b)) => Ok((parse(a)?, parse(b)?)),
            None => {
                let v = parse(&value)?;
                Ok((v, v))
            }
        }
    }
}
