//! # Recurrent Layer
//!
//! `rec` either runs a built-in LSTM over whole sequences (string `unit`)
//! or evaluates a subnetwork once per step (dict `unit`).
//!
//! Inside a subnetwork, `prev:x` reads the value `x` had at the previous
//! step. Those values live in a per-step arena: before step 0 it holds each
//! referenced layer's `initial_output`, and it is replaced as a whole when a
//! step completes. Under beam search every `choice` may reorder and widen
//! the rows; the arena, the carried cell states and the collected history
//! are gathered along with it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use serde_json::{Map, Value};
use tracing::debug;

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::beam::BeamState;
use crate::network::graph::{GraphScope, LayerDefs};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef, RunMode};
use crate::network::layers::linear::{dropout, regularization};
use crate::network::layers::rnn_cell::{LstmWeights, check_unit};
use crate::network::layers::{choice, first_lengths};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx, combined_spec, input_dim};
use crate::network::value::{Data, concat_features};

/// Registration of the `rec` class.
pub const CLASS: LayerClass = LayerClass {
    name: "rec",
    infer,
    build,
};

/// Name of the unit layer whose values form the output.
const OUTPUT_LAYER: &str = "output";
/// Name of the unit layer that flags finished rows.
const END_LAYER: &str = "end";

fn source_specs(sources: &[LayerRef], ctx: &mut dyn NetCtx) -> Result<Vec<DataSpec>> {
    sources.iter().map(|s| ctx.spec(s)).collect()
}

fn unit_input_spec(name: &str, specs: &[DataSpec]) -> Result<Option<DataSpec>> {
    if specs.is_empty() {
        return Ok(None);
    }
    combined_spec(&format!("{name}:source"), specs).map(Some)
}

fn unit_map<'o>(opts: &'o LayerOpts) -> Result<Option<&'o Map<String, Value>>> {
    match opts.value("unit") {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::String(_)) => Ok(None),
        _ => Err(KairoError::config(format!(
            "layer {:?}: unit must be a cell name or a layer dict",
            opts.name
        ))),
    }
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    if ctx.in_unit() {
        return Err(KairoError::config(format!(
            "layer {:?}: recurrent layers cannot be nested",
            opts.name
        )));
    }
    let sources = opts.from(false)?;
    match unit_map(opts)? {
        None => {
            check_unit(opts, opts.str("unit").unwrap_or_default())?;
            let n_out = opts
                .usize("n_out")?
                .ok_or_else(|| KairoError::config(format!("layer {:?} needs n_out", opts.name)))?;
            let specs = source_specs(&sources, ctx)?;
            if specs.is_empty() || specs.iter().any(|s| !s.time_axis) {
                return Err(KairoError::config(format!(
                    "layer {:?}: an LSTM unit needs sources with a time axis",
                    opts.name
                )));
            }
            Ok(DataSpec::dense(&opts.name, n_out))
        }
        Some(map) => {
            let defs = LayerDefs::from_map(map)?;
            if !defs.contains(OUTPUT_LAYER) {
                return Err(KairoError::config(format!(
                    "layer {:?}: recurrent unit has no {OUTPUT_LAYER:?} layer",
                    opts.name
                )));
            }
            let specs = source_specs(&sources, ctx)?;
            let unit_input = unit_input_spec(&opts.name, &specs)?;
            let registry = ctx.registry();
            let mut scope = GraphScope::unit(&defs, registry, ctx, unit_input);
            Ok(scope.infer(OUTPUT_LAYER)?.with_time())
        }
    }
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let sources = opts.from(false)?;
    let specs = env.specs(&sources)?;
    let (dropout, l2) = regularization(opts)?;
    let body = match unit_map(opts)? {
        None => {
            let direction = match opts.value("direction") {
                None | Some(Value::Null) => 1,
                Some(v) => v.as_i64().unwrap_or(0),
            };
            if direction != 1 && direction != -1 {
                return Err(KairoError::config(format!(
                    "layer {:?}: direction must be 1 or -1",
                    opts.name
                )));
            }
            let prefix = env.param_name(&opts.name, "");
            let weights = LstmWeights::create(env.params, &prefix, input_dim(&specs), env.output.dim)?;
            Body::Lstm(LstmBody {
                weights,
                backward: direction < 0,
                dropout,
                l2,
            })
        }
        Some(map) => Body::Unit(UnitBody::create(opts, map, &specs, env)?),
    };
    Ok(Box::new(RecLayer {
        name: opts.name.clone(),
        sources,
        deps: opts.refs(false)?,
        output: env.output.clone(),
        body,
    }))
}

/// A recurrent layer.
pub struct RecLayer {
    name: String,
    sources: Vec<LayerRef>,
    deps: Vec<LayerRef>,
    output: DataSpec,
    body: Body,
}

enum Body {
    Lstm(LstmBody),
    Unit(UnitBody),
}

impl Layer for RecLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &'static str {
        CLASS.name
    }

    fn output_spec(&self) -> &DataSpec {
        &self.output
    }

    fn dependencies(&self) -> Vec<LayerRef> {
        self.deps.clone()
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        match &self.body {
            Body::Lstm(lstm) => lstm.forward(self, env),
            Body::Unit(unit) => unit.forward(self, env),
        }
    }

    fn l2_penalty(&self) -> Result<Option<Tensor>> {
        match &self.body {
            Body::Lstm(lstm) => lstm.weights.l2(lstm.l2),
            Body::Unit(unit) => {
                let mut total: Option<Tensor> = None;
                for layer in &unit.layers {
                    if let Some(term) = layer.l2_penalty()? {
                        total = Some(match total {
                            Some(t) => (t + term)?,
                            None => term,
                        });
                    }
                }
                Ok(total)
            }
        }
    }
}

/// Masked LSTM over the full sequence; padded frames leave the state
/// untouched and output zeros.
struct LstmBody {
    weights: LstmWeights,
    backward: bool,
    dropout: f64,
    l2: f64,
}

impl LstmBody {
    fn forward(&self, rec: &RecLayer, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let sources = env.resolve_all(&rec.sources)?;
        let timed = sources.iter().find(|s| s.lengths.is_some()).ok_or_else(|| {
            KairoError::config(format!("layer {:?}: sources have no time axis", rec.name))
        })?;
        let lengths = timed.lengths.clone();
        let mask = timed.seq_mask()?;

        let mut x = concat_features(&sources)?;
        if env.mode().is_train() && self.dropout > 0.0 {
            x = dropout(&x, self.dropout, env.rng())?;
        }
        let (batch, time) = (x.dim(0)?, x.dim(1)?);
        let n = self.weights.n_out();
        let projected = self.weights.project(&x)?;
        let mut h = Tensor::zeros((batch, n), DType::F32, x.device())?;
        let mut c = h.clone();
        let mut outputs: Vec<Option<Tensor>> = vec![None; time];

        let steps: Vec<usize> = if self.backward {
            (0..time).rev().collect()
        } else {
            (0..time).collect()
        };
        for t in steps {
            let m = mask.narrow(1, t, 1)?;
            let keep = m.affine(-1.0, 1.0)?;
            let xt = projected.narrow(1, t, 1)?.squeeze(1)?;
            let (h_new, c_new) = self.weights.step(&xt, &h, &c)?;
            h = (h_new.broadcast_mul(&m)? + h.broadcast_mul(&keep)?)?;
            c = (c_new.broadcast_mul(&m)? + c.broadcast_mul(&keep)?)?;
            outputs[t] = Some(h_new.broadcast_mul(&m)?);
        }

        let values = if time == 0 {
            Tensor::zeros((batch, 0, n), DType::F32, x.device())?
        } else {
            let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();
            Tensor::stack(&outputs, 1)?
        };
        env.set_state(&rec.name, vec![h, c]);
        Data::new(rec.output.clone(), values, lengths)
    }
}

/// Start value of a `prev:` slot.
#[derive(Debug, Clone, PartialEq)]
enum InitialOutput {
    Const(f32),
    Base(String),
}

impl InitialOutput {
    fn parse(opts: &LayerOpts) -> Result<Self> {
        match opts.value("initial_output") {
            None | Some(Value::Null) => Ok(InitialOutput::Const(0.0)),
            Some(Value::Number(n)) => Ok(InitialOutput::Const(n.as_f64().unwrap_or(0.0) as f32)),
            Some(Value::String(s)) => match s.as_str() {
                "zeros" => Ok(InitialOutput::Const(0.0)),
                "ones" => Ok(InitialOutput::Const(1.0)),
                other => match LayerRef::parse(other)? {
                    LayerRef::Base(name) => Ok(InitialOutput::Base(name)),
                    r => Err(KairoError::config(format!(
                        "layer {:?}: initial_output {r} must be a constant or a base: layer",
                        opts.name
                    ))),
                },
            },
            Some(_) => Err(KairoError::config(format!(
                "layer {:?}: invalid initial_output",
                opts.name
            ))),
        }
    }

    fn value(
        &self,
        spec: &DataSpec,
        rows: usize,
        base: &BTreeMap<String, Data>,
        device: &Device,
    ) -> Result<Data> {
        let values = match self {
            InitialOutput::Const(c) => {
                let mut shape = vec![rows];
                shape.extend(spec.feature_shape());
                Tensor::full(*c, shape, device)?.to_dtype(spec.dtype)?
            }
            InitialOutput::Base(name) => {
                let data = base.get(name).ok_or_else(|| {
                    KairoError::config(format!("initial_output base:{name} has no value"))
                })?;
                data.values.to_dtype(spec.dtype)?
            }
        };
        Data::new(spec.clone(), values, None)
    }
}

/// Subnetwork evaluated once per step.
struct UnitBody {
    layers: Vec<Box<dyn Layer>>,
    initial: BTreeMap<String, (DataSpec, InitialOutput)>,
    input_spec: Option<DataSpec>,
    target: Option<String>,
    max_seq_len: Option<usize>,
    has_choice: bool,
    has_end: bool,
    device: Device,
}

impl UnitBody {
    fn create(
        opts: &LayerOpts,
        map: &Map<String, Value>,
        specs: &[DataSpec],
        env: &mut BuildEnv<'_>,
    ) -> Result<Self> {
        let defs = LayerDefs::from_map(map)?;
        let input_spec = unit_input_spec(&opts.name, specs)?;
        let prefix = format!("{}{}/", env.prefix, opts.name);
        let layers = {
            let mut scope =
                GraphScope::unit(&defs, env.registry.clone(), &mut *env.ctx, input_spec.clone());
            scope.build_layers(&mut *env.params, &prefix)?
        };

        let mut prev_used = BTreeSet::new();
        for layer in &layers {
            for dep in layer.dependencies() {
                if let LayerRef::Prev(name) = dep {
                    prev_used.insert(name);
                }
            }
        }
        let mut initial = BTreeMap::new();
        for name in prev_used {
            let layer = layers
                .iter()
                .find(|l| l.name() == name)
                .ok_or_else(|| KairoError::config(format!("unknown layer prev:{name}")))?;
            let init = InitialOutput::parse(defs.get(&name)?)?;
            initial.insert(name, (layer.output_spec().clone(), init));
        }

        let target = match opts.str("target") {
            Some(t) => Some(t.to_string()),
            None => layers.iter().find_map(|l| l.target().map(str::to_string)),
        };
        let has_choice = layers.iter().any(|l| l.class() == choice::CLASS.name);
        let has_end = layers.iter().any(|l| l.name() == END_LAYER);
        Ok(Self {
            layers,
            initial,
            input_spec,
            target,
            max_seq_len: opts.usize("max_seq_len")?,
            has_choice,
            has_end,
            device: env.params.device().clone(),
        })
    }

    fn forward(&self, rec: &RecLayer, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let mode = env.mode();
        let base = env.values;
        let externs = env.externs;

        let sources = env.resolve_all(&rec.sources)?;
        let input = match (sources.as_slice(), &self.input_spec) {
            ([], _) | (_, None) => None,
            ([single], _) => Some(single.clone()),
            (many, Some(spec)) => Some(Data::new(
                spec.clone(),
                concat_features(many)?,
                first_lengths(many),
            )?),
        };
        let target = self.target.as_deref().and_then(|key| externs.get(key));
        let search = mode == RunMode::Search && self.has_choice;
        let forced = if mode == RunMode::Search { None } else { target };
        let greedy = self.has_choice && !search && forced.is_none();

        let (batch, steps, fixed_lengths) = if let Some(input) = &input {
            (input.batch_size()?, input.time_len()?.unwrap_or(0), input.lengths.clone())
        } else if let Some(target) = forced {
            (target.batch_size()?, target.time_len()?.unwrap_or(0), target.lengths.clone())
        } else {
            let max_seq_len = self.max_seq_len.ok_or_else(|| {
                KairoError::config(format!(
                    "layer {:?}: without sources or target the unit needs max_seq_len",
                    rec.name
                ))
            })?;
            let batch = externs
                .values()
                .next()
                .map(Data::batch_size)
                .transpose()?
                .ok_or_else(|| KairoError::data(format!("layer {:?}: empty feed", rec.name)))?;
            (batch, max_seq_len, None)
        };
        debug!(layer = %rec.name, ?mode, batch, steps, search, greedy, "running recurrent unit");

        let mut beam = (search || greedy).then(|| BeamState::new(batch));
        let mut prev = BTreeMap::new();
        for (name, (spec, init)) in &self.initial {
            prev.insert(name.clone(), init.value(spec, batch, base, &self.device)?);
        }
        let mut states: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
        let mut history: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
        let mut ended: Vec<Option<usize>> = vec![None; batch];
        let mut steps_run = 0;

        for t in 0..steps {
            let step_frames = externs
                .iter()
                .map(|(key, data)| {
                    let frame = if data.spec.time_axis {
                        data.frame(t)?
                    } else {
                        data.clone()
                    };
                    Ok((key.clone(), frame))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;
            let input_frame = input.as_ref().map(|i| i.frame(t)).transpose()?;

            let mut rows = beam.as_ref().map(|b| b.batch_rows.clone());
            let mut step_externs = tile_map(&step_frames, rows.as_deref())?;
            let mut unit_input = tile(input_frame.as_ref(), rows.as_deref())?;
            let mut values: BTreeMap<String, Data> = BTreeMap::new();
            let mut new_states: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();

            for layer in &self.layers {
                let out = {
                    let mut step_env = ForwardEnv {
                        mode,
                        step: Some(t),
                        values: &values,
                        prev: Some(&prev),
                        base: Some(base),
                        base_rows: rows.as_deref(),
                        externs: &step_externs,
                        unit_input: unit_input.as_ref(),
                        prev_states: &states,
                        new_states: &mut new_states,
                        beam: beam.as_mut(),
                        greedy,
                        rng: &mut *env.rng,
                        sub_losses: &mut *env.sub_losses,
                    };
                    layer.forward(&mut step_env)?
                };
                if let Some(order) = beam.as_mut().and_then(BeamState::take_reorder) {
                    reorder_values(&mut values, &order)?;
                    reorder_values(&mut prev, &order)?;
                    reorder_tensors(&mut states, &order)?;
                    reorder_tensors(&mut new_states, &order)?;
                    reorder_tensors(&mut history, &order)?;
                    rows = beam.as_ref().map(|b| b.batch_rows.clone());
                    step_externs = tile_map(&step_frames, rows.as_deref())?;
                    unit_input = tile(input_frame.as_ref(), rows.as_deref())?;
                }
                values.insert(layer.name().to_string(), out);
            }

            if self.has_end {
                if let Some(end) = values.get(END_LAYER) {
                    let flags: Vec<bool> = end
                        .values
                        .to_dtype(DType::U8)?
                        .flatten_all()?
                        .to_vec1::<u8>()?
                        .into_iter()
                        .map(|v| v != 0)
                        .collect();
                    match beam.as_mut() {
                        Some(beam) => beam.mark_ended(&flags, t)?,
                        None => {
                            for (row, &flag) in flags.iter().enumerate() {
                                if flag && row < ended.len() && ended[row].is_none() {
                                    ended[row] = Some(t + 1);
                                }
                            }
                        }
                    }
                }
            }

            for (name, value) in &values {
                history
                    .entry(name.clone())
                    .or_default()
                    .push(value.values.clone());
            }
            prev = values;
            states = new_states;
            steps_run = t + 1;

            let all_ended = match &beam {
                Some(beam) => beam.all_finished(),
                None => ended.iter().all(Option::is_some),
            };
            if self.has_end && fixed_lengths.is_none() && all_ended {
                break;
            }
        }

        let rows = beam.as_ref().map_or(batch, BeamState::rows);
        let output_spec = rec.output.clone();
        let values = stack_history(history.get(OUTPUT_LAYER), &output_spec, rows, &self.device)?;
        let lengths = match (beam.as_mut(), fixed_lengths) {
            (Some(beam), None) => {
                beam.finalize(steps_run);
                beam.lengths.clone()
            }
            (Some(beam), Some(lengths)) => beam
                .batch_rows
                .iter()
                .map(|&r| lengths[r as usize])
                .collect(),
            (None, Some(lengths)) => lengths,
            (None, None) => ended.iter().map(|e| e.unwrap_or(steps_run)).collect(),
        };
        let data = Data::new(output_spec, values, Some(lengths))?;

        if beam.is_none() && mode != RunMode::Search {
            for layer in &self.layers {
                let Some(key) = layer.target() else {
                    continue;
                };
                let (Some(target), Some(hist)) = (externs.get(key), history.get(layer.name())) else {
                    continue;
                };
                let spec = layer.output_spec().clone().with_time();
                let stacked = Data::new(spec, Tensor::stack(hist, 1)?, target.lengths.clone())?;
                if let Some(loss) = layer.loss(&stacked, target)? {
                    env.push_sub_loss(format!("{}/{}", rec.name, layer.name()), loss);
                }
            }
        }

        Ok(match beam {
            Some(beam) => data.with_beam(Some(Arc::new(beam.info()))),
            None => data,
        })
    }
}

/// Per-step values stacked on a new time axis.
fn stack_history(
    history: Option<&Vec<Tensor>>,
    spec: &DataSpec,
    rows: usize,
    device: &Device,
) -> Result<Tensor> {
    match history {
        Some(steps) if !steps.is_empty() => Ok(Tensor::stack(steps, 1)?),
        _ => {
            let mut shape = vec![rows, 0];
            shape.extend(spec.feature_shape());
            Ok(Tensor::zeros(shape, spec.dtype, device)?)
        }
    }
}

fn tile(data: Option<&Data>, rows: Option<&[u32]>) -> Result<Option<Data>> {
    match (data, rows) {
        (Some(data), Some(rows)) => data.select_rows(rows).map(Some),
        (data, None) => Ok(data.cloned()),
        (None, _) => Ok(None),
    }
}

fn tile_map(frames: &BTreeMap<String, Data>, rows: Option<&[u32]>) -> Result<BTreeMap<String, Data>> {
    frames
        .iter()
        .map(|(key, data)| Ok((key.clone(), tile(Some(data), rows)?.unwrap_or_else(|| data.clone()))))
        .collect()
}

fn reorder_values(values: &mut BTreeMap<String, Data>, order: &[u32]) -> Result<()> {
    for value in values.values_mut() {
        *value = value.select_rows(order)?;
    }
    Ok(())
}

fn reorder_tensors(map: &mut BTreeMap<String, Vec<Tensor>>, order: &[u32]) -> Result<()> {
    let Some(device) = map.values().flatten().next().map(|t| t.device().clone()) else {
        return Ok(());
    };
    let index = Tensor::new(order, &device)?;
    for tensors in map.values_mut() {
        for tensor in tensors.iter_mut() {
            *tensor = tensor.index_select(&index, 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn initial_output_forms() {
        let opts = |v: Value| LayerOpts::new("output", &v).unwrap();
        assert_eq!(
            InitialOutput::parse(&opts(json!({"class": "choice"}))).unwrap(),
            InitialOutput::Const(0.0)
        );
        assert_eq!(
            InitialOutput::parse(&opts(json!({"class": "choice", "initial_output": 2}))).unwrap(),
            InitialOutput::Const(2.0)
        );
        assert_eq!(
            InitialOutput::parse(&opts(json!({"class": "copy", "initial_output": "base:enc"})))
                .unwrap(),
            InitialOutput::Base("enc".into())
        );
        assert!(InitialOutput::parse(&opts(json!({"class": "copy", "initial_output": "prev:x"}))).is_err());
    }

    #[test]
    fn constant_initial_output_matches_spec() {
        let spec = DataSpec::dense("output", 1)
            .with_dtype(DType::I64)
            .without_time();
        let value = InitialOutput::Const(0.0)
            .value(&spec, 3, &BTreeMap::new(), &Device::Cpu)
            .unwrap();
        assert_eq!(value.values.dims(), &[3, 1]);
        assert_eq!(value.values.dtype(), DType::I64);
    }

    #[test]
    fn tensors_follow_reorder() {
        let mut map = BTreeMap::new();
        map.insert(
            "s".to_string(),
            vec![Tensor::new(&[[1f32], [2.0]], &Device::Cpu).unwrap()],
        );
        reorder_tensors(&mut map, &[1, 1, 0]).unwrap();
        assert_eq!(
            map["s"][0].to_vec2::<f32>().unwrap(),
            vec![vec![2.0], vec![2.0], vec![1.0]]
        );
    }
}
