//! The `choice` layer: picks a label per row from class posteriors. Under
//! search it expands the beam; otherwise it is teacher-forced from its
//! target or, without one, takes the best label.

use candle_core::{D, DType, Tensor};

use crate::data::extern_data::{DEFAULT_TARGET_KEY, DataSpec};
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef, RunMode};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::Data;

/// Registration of the `choice` class.
pub const CLASS: LayerClass = LayerClass {
    name: "choice",
    infer,
    build,
};

fn single_source(opts: &LayerOpts, in_unit: bool) -> Result<LayerRef> {
    let mut sources = opts.from(in_unit)?;
    if sources.len() != 1 {
        return Err(KairoError::config(format!(
            "layer {:?}: choice takes exactly one source",
            opts.name
        )));
    }
    Ok(sources.remove(0))
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let source = ctx.spec(&single_source(opts, ctx.in_unit())?)?;
    if source.sparse {
        return Err(KairoError::config(format!(
            "layer {:?}: choice needs dense class scores",
            opts.name
        )));
    }
    let spec = DataSpec::sparse(&opts.name, source.dim);
    Ok(if source.time_axis { spec } else { spec.without_time() })
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let beam_size = opts.usize("beam_size")?.unwrap_or(1);
    if beam_size == 0 {
        return Err(KairoError::config(format!(
            "layer {:?}: beam_size must be positive",
            opts.name
        )));
    }
    Ok(Box::new(ChoiceLayer {
        name: opts.name.clone(),
        source: single_source(opts, env.ctx.in_unit())?,
        target: opts.str("target").unwrap_or(DEFAULT_TARGET_KEY).to_string(),
        beam_size,
        output: env.output.clone(),
    }))
}

pub struct ChoiceLayer {
    name: String,
    source: LayerRef,
    target: String,
    beam_size: usize,
    output: DataSpec,
}

impl ChoiceLayer {
    fn labels(&self, values: Tensor, lengths: Option<Vec<usize>>) -> Result<Data> {
        Data::new(self.output.clone(), values.to_dtype(DType::U32)?, lengths)
    }
}

impl Layer for ChoiceLayer {
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
        vec![self.source.clone()]
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let probs = env.resolve(&self.source)?;
        let beam_size = if env.mode() == RunMode::Search {
            self.beam_size
        } else {
            1
        };
        let forced = if env.greedy() || env.mode() == RunMode::Search {
            None
        } else {
            env.extern_data(&self.target).cloned()
        };

        if let Some(target) = forced {
            return self.labels(target.values, target.lengths);
        }
        if env.in_unit() {
            if let Some(beam) = env.beam_mut() {
                let num_classes = self.output.dim;
                let log_probs = probs
                    .values
                    .clamp(1e-30f32, 1f32)?
                    .log()?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                let labels = beam.expand(&log_probs, num_classes, beam_size)?;
                let rows = labels.len();
                return self.labels(Tensor::from_vec(labels, rows, probs.values.device())?, None);
            }
            if env.mode() != RunMode::Search {
                return Err(KairoError::data(format!(
                    "layer {:?}: no target {:?} to follow",
                    self.name, self.target
                )));
            }
        }
        let best = probs.values.argmax(D::Minus1)?;
        self.labels(best, probs.lengths.clone())
    }
}
