//! The `get_last_hidden_state` layer: final recurrent state of its sources.

use candle_core::{D, Tensor};

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::Data;

/// Registration of the `get_last_hidden_state` class.
pub const CLASS: LayerClass = LayerClass {
    name: "get_last_hidden_state",
    infer,
    build,
};

fn infer(opts: &LayerOpts, _ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let n_out = opts
        .usize("n_out")?
        .ok_or_else(|| KairoError::config(format!("layer {:?} needs n_out", opts.name)))?;
    Ok(DataSpec::dense(&opts.name, n_out).without_time())
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let sources = opts.from(env.ctx.in_unit())?;
    let mut names = Vec::with_capacity(sources.len());
    for source in &sources {
        match source {
            LayerRef::Layer(name) => names.push(name.clone()),
            other => {
                return Err(KairoError::config(format!(
                    "layer {:?}: {other} carries no recurrent state",
                    opts.name
                )));
            }
        }
    }
    let state_index = match opts.str("key").unwrap_or("c") {
        "h" => 0,
        "c" => 1,
        other => {
            return Err(KairoError::config(format!(
                "layer {:?}: unknown state key {other:?}",
                opts.name
            )));
        }
    };
    let total: usize = env.specs(&sources)?.iter().map(|s| s.dim).sum();
    if total != env.output.dim {
        return Err(KairoError::config(format!(
            "layer {:?}: sources have {total} state units, n_out is {}",
            opts.name, env.output.dim
        )));
    }
    Ok(Box::new(LastStateLayer {
        name: opts.name.clone(),
        sources,
        names,
        state_index,
        output: env.output.clone(),
    }))
}

pub struct LastStateLayer {
    name: String,
    sources: Vec<LayerRef>,
    names: Vec<String>,
    state_index: usize,
    output: DataSpec,
}

impl Layer for LastStateLayer {
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
        self.sources.clone()
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let parts = self
            .names
            .iter()
            .map(|name| {
                env.current_state(name)
                    .and_then(|state| state.get(self.state_index))
                    .cloned()
                    .ok_or_else(|| {
                        KairoError::config(format!(
                            "layer {:?}: {name:?} left no recurrent state",
                            self.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Data::new(self.output.clone(), Tensor::cat(&parts, D::Minus1)?, None)
    }
}
