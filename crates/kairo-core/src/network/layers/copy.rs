//! The `copy` layer: passes one source through or concatenates several.

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::layers::first_lengths;
use crate::network::registry::{BuildEnv, LayerClass, NetCtx, combined_spec};
use crate::network::value::{Data, concat_features};

/// Registration of the `copy` class.
pub const CLASS: LayerClass = LayerClass {
    name: "copy",
    infer,
    build,
};

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let specs = opts
        .from(ctx.in_unit())?
        .iter()
        .map(|s| ctx.spec(s))
        .collect::<Result<Vec<_>>>()?;
    combined_spec(&opts.name, &specs)
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let sources = opts.from(env.ctx.in_unit())?;
    if sources.is_empty() {
        return Err(KairoError::config(format!("layer {:?} has no sources", opts.name)));
    }
    Ok(Box::new(CopyLayer {
        name: opts.name.clone(),
        sources,
        output: env.output.clone(),
    }))
}

pub struct CopyLayer {
    name: String,
    sources: Vec<LayerRef>,
    output: DataSpec,
}

impl Layer for CopyLayer {
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
        let mut sources = env.resolve_all(&self.sources)?;
        if sources.len() == 1 {
            let mut single = sources.remove(0);
            single.spec = self.output.clone();
            return Ok(single);
        }
        let values = concat_features(&sources)?;
        let lengths = if self.output.time_axis {
            first_lengths(&sources)
        } else {
            None
        };
        let beam = sources.iter().find_map(|s| s.beam.clone());
        Ok(Data::new(self.output.clone(), values, lengths)?.with_beam(beam))
    }
}
