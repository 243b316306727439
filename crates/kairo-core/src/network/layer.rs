//! Layer contract, layer options and the per-call forward environment.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;
use oorandom::Rand32;
use serde_json::{Map, Value};

use crate::data::extern_data::{DEFAULT_INPUT_KEY, DataSpec};
use crate::error::{KairoError, Result};
use crate::network::beam::BeamState;
use crate::network::value::Data;

/// How the network is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Gradients are taken; dropout is active.
    Train,
    /// Held-out evaluation or plain forwarding.
    Eval,
    /// Beam search through `choice` layers.
    Search,
}

impl RunMode {
    /// Whether dropout and other train-only behavior applies.
    pub fn is_train(self) -> bool {
        self == RunMode::Train
    }
}

/// A reference from one layer to a value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerRef {
    /// A layer of the same network.
    Layer(String),
    /// A layer's value at the previous step of the enclosing recurrent unit.
    Prev(String),
    /// A layer of the network enclosing a recurrent unit.
    Base(String),
    /// An extern data stream; inside a unit `data` and `data:source` are
    /// the current input frame.
    Data(String),
}

impl LayerRef {
    /// Parses `prev:x`, `base:x`, `data`, `data:key` or a plain layer name.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = if let Some(name) = s.strip_prefix("prev:") {
            LayerRef::Prev(name.to_string())
        } else if let Some(name) = s.strip_prefix("base:") {
            LayerRef::Base(name.to_string())
        } else if s == "data" {
            LayerRef::Data(DEFAULT_INPUT_KEY.to_string())
        } else if let Some(key) = s.strip_prefix("data:") {
            LayerRef::Data(key.to_string())
        } else {
            LayerRef::Layer(s.to_string())
        };
        match &parsed {
            LayerRef::Layer(n) | LayerRef::Prev(n) | LayerRef::Base(n) | LayerRef::Data(n)
                if n.is_empty() =>
            {
                Err(KairoError::config(format!("empty layer reference {s:?}")))
            }
            _ => Ok(parsed),
        }
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerRef::Layer(n) => write!(f, "{n}"),
            LayerRef::Prev(n) => write!(f, "prev:{n}"),
            LayerRef::Base(n) => write!(f, "base:{n}"),
            LayerRef::Data(k) => write!(f, "data:{k}"),
        }
    }
}

/// Keys whose string values are layer references besides `from`.
const REF_KEYS: &[&str] = &["base", "base_ctx", "initial_state", "initial_output"];

fn is_ref_string(s: &str) -> bool {
    !matches!(s, "zeros" | "ones") && s.parse::<f64>().is_err()
}

/// Options of one layer definition: a JSON object with at least `class`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOpts {
    /// Layer name.
    pub name: String,
    map: Map<String, Value>,
}

impl LayerOpts {
    /// Wraps a JSON layer definition.
    pub fn new(name: &str, value: &Value) -> Result<Self> {
        let map = value.as_object().cloned().ok_or_else(|| {
            KairoError::config(format!("layer {name:?} must be a JSON object"))
        })?;
        Ok(Self {
            name: name.to_string(),
            map,
        })
    }

    /// The `class` option.
    pub fn class(&self) -> Result<&str> {
        self.str("class")
            .ok_or_else(|| KairoError::config(format!("layer {:?} has no class", self.name)))
    }

    /// Raw option.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// String option.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    fn invalid(&self, key: &str, expected: &str) -> KairoError {
        KairoError::config(format!(
            "layer {:?}: option {key:?} must be {expected}",
            self.name
        ))
    }

    /// Non-negative integer option.
    pub fn usize(&self, key: &str) -> Result<Option<usize>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| self.invalid(key, "a non-negative integer")),
        }
    }

    /// Number option.
    pub fn f64(&self, key: &str) -> Result<Option<f64>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a number")),
        }
    }

    /// Boolean option.
    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.invalid(key, "a boolean")),
        }
    }

    /// Sources; absent `from` means `data` at the top level and nothing
    /// inside a recurrent unit.
    pub fn from(&self, in_unit: bool) -> Result<Vec<LayerRef>> {
        match self.map.get("from") {
            None | Some(Value::Null) => {
                if in_unit {
                    Ok(Vec::new())
                } else {
                    Ok(vec![LayerRef::Data(DEFAULT_INPUT_KEY.to_string())])
                }
            }
            Some(Value::String(s)) => Ok(vec![LayerRef::parse(s)?]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| self.invalid("from", "a string or list of strings"))
                        .and_then(LayerRef::parse)
                })
                .collect(),
            Some(_) => Err(self.invalid("from", "a string or list of strings")),
        }
    }

    /// The nested unit definition of a `rec` layer, if it is a dict.
    pub fn unit_dict(&self) -> Option<&Map<String, Value>> {
        self.map.get("unit").and_then(Value::as_object)
    }

    /// Every reference the layer resolves at run time: its sources, the
    /// string values of reference options, and `base:` references made by
    /// its recurrent unit (as plain references at this level).
    pub fn refs(&self, in_unit: bool) -> Result<Vec<LayerRef>> {
        let mut refs = self.from(in_unit)?;
        for key in REF_KEYS {
            match self.map.get(*key) {
                Some(Value::String(s)) if is_ref_string(s) => refs.push(LayerRef::parse(s)?),
                Some(Value::Object(parts)) => {
                    for part in parts.values() {
                        if let Some(s) = part.as_str().filter(|s| is_ref_string(s)) {
                            refs.push(LayerRef::parse(s)?);
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(unit) = self.unit_dict() {
            for (name, def) in unit {
                for r in LayerOpts::new(name, def)?.refs(true)? {
                    if let LayerRef::Base(outer) = r {
                        refs.push(LayerRef::Layer(outer));
                    }
                }
            }
        }
        Ok(refs)
    }
}

/// A layer's loss and error sums over its valid frames.
#[derive(Debug, Clone)]
pub struct LossValue {
    /// Differentiable scalar loss sum.
    pub loss: Option<Tensor>,
    /// Error count or distance sum.
    pub error: Option<f64>,
    /// Number of frames the sums run over.
    pub frames: usize,
}

impl LossValue {
    /// Loss sum on the host.
    pub fn loss_sum(&self) -> Result<Option<f64>> {
        self.loss
            .as_ref()
            .map(|t| Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?))
            .transpose()
    }
}

/// A node of the network graph.
pub trait Layer {
    /// Layer name.
    fn name(&self) -> &str;

    /// Registered class name.
    fn class(&self) -> &'static str;

    /// Output contract.
    fn output_spec(&self) -> &DataSpec;

    /// Every reference `forward` resolves.
    fn dependencies(&self) -> Vec<LayerRef>;

    /// Computes the output.
    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data>;

    /// Extern data key the loss is computed against.
    fn target(&self) -> Option<&str> {
        None
    }

    /// Loss and error of an output against its target.
    fn loss(&self, _output: &Data, _target: &Data) -> Result<Option<LossValue>> {
        Ok(None)
    }

    /// Weight decay term added to the objective.
    fn l2_penalty(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

/// Everything a layer can see while computing its output.
pub struct ForwardEnv<'a> {
    pub(crate) mode: RunMode,
    pub(crate) step: Option<usize>,
    pub(crate) values: &'a BTreeMap<String, Data>,
    pub(crate) prev: Option<&'a BTreeMap<String, Data>>,
    pub(crate) base: Option<&'a BTreeMap<String, Data>>,
    pub(crate) base_rows: Option<&'a [u32]>,
    pub(crate) externs: &'a BTreeMap<String, Data>,
    pub(crate) unit_input: Option<&'a Data>,
    pub(crate) prev_states: &'a BTreeMap<String, Vec<Tensor>>,
    pub(crate) new_states: &'a mut BTreeMap<String, Vec<Tensor>>,
    pub(crate) beam: Option<&'a mut BeamState>,
    pub(crate) greedy: bool,
    pub(crate) rng: &'a mut Rand32,
    pub(crate) sub_losses: &'a mut Vec<(String, LossValue)>,
}

impl ForwardEnv<'_> {
    /// Run mode.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Step index inside a recurrent unit.
    pub fn step(&self) -> Option<usize> {
        self.step
    }

    /// Whether the caller is a recurrent unit step.
    pub fn in_unit(&self) -> bool {
        self.step.is_some()
    }

    /// Resolves a reference to its current value.
    pub fn resolve(&self, r: &LayerRef) -> Result<Data> {
        let missing = || KairoError::config(format!("reference {r} has no value here"));
        match r {
            LayerRef::Layer(name) => self.values.get(name).cloned().ok_or_else(missing),
            LayerRef::Prev(name) => self
                .prev
                .and_then(|prev| prev.get(name))
                .cloned()
                .ok_or_else(missing),
            LayerRef::Base(name) => {
                let value = self.base.and_then(|b| b.get(name)).ok_or_else(missing)?;
                match self.base_rows {
                    Some(rows) => value.select_rows(rows),
                    None => Ok(value.clone()),
                }
            }
            LayerRef::Data(key) => {
                if self.in_unit() && (key == DEFAULT_INPUT_KEY || key == "source") {
                    return self.unit_input.cloned().ok_or_else(missing);
                }
                self.externs.get(key).cloned().ok_or_else(missing)
            }
        }
    }

    /// Resolves several references in order.
    pub fn resolve_all(&self, refs: &[LayerRef]) -> Result<Vec<Data>> {
        refs.iter().map(|r| self.resolve(r)).collect()
    }

    /// Extern stream by key, as seen at this level.
    pub fn extern_data(&self, key: &str) -> Option<&Data> {
        self.externs.get(key)
    }

    /// Values computed so far at this level.
    pub fn values(&self) -> &BTreeMap<String, Data> {
        self.values
    }

    /// All extern streams at this level.
    pub fn externs(&self) -> &BTreeMap<String, Data> {
        self.externs
    }

    /// Recurrent state a layer left at the previous step.
    pub fn prev_state(&self, name: &str) -> Option<&[Tensor]> {
        self.prev_states.get(name).map(Vec::as_slice)
    }

    /// Recurrent state the layer leaves for the next step.
    pub fn set_state(&mut self, name: &str, state: Vec<Tensor>) {
        self.new_states.insert(name.to_string(), state);
    }

    /// State a layer at this level has set during the current call.
    pub fn current_state(&self, name: &str) -> Option<&[Tensor]> {
        self.new_states.get(name).map(Vec::as_slice)
    }

    /// Beam of the enclosing search, if searching.
    pub fn beam_mut(&mut self) -> Option<&mut BeamState> {
        self.beam.as_deref_mut()
    }

    /// Whether choices are taken greedily instead of from a target.
    pub fn greedy(&self) -> bool {
        self.greedy
    }

    /// Generator for dropout masks.
    pub fn rng(&mut self) -> &mut Rand32 {
        self.rng
    }

    /// Records a loss computed inside a nested unit.
    pub fn push_sub_loss(&mut self, name: String, loss: LossValue) {
        self.sub_losses.push((name, loss));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_references() {
        assert_eq!(LayerRef::parse("prev:out").unwrap(), LayerRef::Prev("out".into()));
        assert_eq!(LayerRef::parse("base:enc").unwrap(), LayerRef::Base("enc".into()));
        assert_eq!(LayerRef::parse("data").unwrap(), LayerRef::Data("data".into()));
        assert_eq!(
            LayerRef::parse("data:classes").unwrap(),
            LayerRef::Data("classes".into())
        );
        assert_eq!(LayerRef::parse("hidden").unwrap(), LayerRef::Layer("hidden".into()));
        assert!(LayerRef::parse("prev:").is_err());
        assert_eq!(LayerRef::Prev("x".into()).to_string(), "prev:x");
    }

    #[test]
    fn default_sources_depend_on_level() {
        let opts = LayerOpts::new("l", &json!({"class": "linear"})).unwrap();
        assert_eq!(opts.from(false).unwrap(), vec![LayerRef::Data("data".into())]);
        assert!(opts.from(true).unwrap().is_empty());

        let opts = LayerOpts::new("l", &json!({"class": "copy", "from": "a"})).unwrap();
        assert_eq!(opts.from(false).unwrap(), vec![LayerRef::Layer("a".into())]);

        let bad = LayerOpts::new("l", &json!({"class": "copy", "from": 3})).unwrap();
        assert!(bad.from(false).is_err());
    }

    #[test]
    fn refs_include_options_and_unit_base_refs() {
        let opts = LayerOpts::new(
            "dec",
            &json!({
                "class": "rec",
                "from": [],
                "unit": {
                    "att": {"class": "dot_attention", "from": ["s"], "base": "base:enc", "base_ctx": "base:ctx"},
                    "s": {"class": "rnn_cell", "from": ["prev:att"], "initial_state": {"c": "base:last", "h": 0}},
                    "output": {"class": "copy", "from": ["att"]}
                }
            }),
        )
        .unwrap();
        let refs = opts.refs(false).unwrap();
        assert!(refs.contains(&LayerRef::Layer("enc".into())));
        assert!(refs.contains(&LayerRef::Layer("ctx".into())));
        assert!(refs.contains(&LayerRef::Layer("last".into())));
        assert!(!refs.iter().any(|r| matches!(r, LayerRef::Prev(_))));
    }

    #[test]
    fn typed_options() {
        let opts = LayerOpts::new(
            "l",
            &json!({"class": "linear", "n_out": 5, "dropout": 0.1, "with_bias": false}),
        )
        .unwrap();
        assert_eq!(opts.class().unwrap(), "linear");
        assert_eq!(opts.usize("n_out").unwrap(), Some(5));
        assert_eq!(opts.f64("dropout").unwrap(), Some(0.1));
        assert!(!opts.bool("with_bias", true).unwrap());
        assert!(opts.usize("dropout").is_err());
        assert!(LayerOpts::new("l", &json!([1])).is_err());
    }
}
