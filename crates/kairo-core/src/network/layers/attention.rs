//! The `dot_attention` layer.

use candle_core::D;

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::layers::{first_lengths, sources_have_time};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::{Data, concat_features};

/// Registration of the `dot_attention` class.
pub const CLASS: LayerClass = LayerClass {
    name: "dot_attention",
    infer,
    build,
};

fn ref_option(opts: &LayerOpts, key: &str) -> Result<LayerRef> {
    let s = opts
        .str(key)
        .ok_or_else(|| KairoError::config(format!("layer {:?} needs {key}", opts.name)))?;
    LayerRef::parse(s)
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let base = ctx.spec(&ref_option(opts, "base")?)?;
    if !base.time_axis {
        return Err(KairoError::config(format!(
            "layer {:?}: attention base needs a time axis",
            opts.name
        )));
    }
    let sources = opts.from(ctx.in_unit())?;
    let spec = DataSpec::dense(&opts.name, base.dim);
    Ok(if sources_have_time(&sources, ctx)? {
        spec
    } else {
        spec.without_time()
    })
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let sources = opts.from(env.ctx.in_unit())?;
    if sources.is_empty() {
        return Err(KairoError::config(format!("layer {:?} has no query", opts.name)));
    }
    let base = ref_option(opts, "base")?;
    let base_ctx = ref_option(opts, "base_ctx")?;
    let query_dim: usize = env.specs(&sources)?.iter().map(|s| s.dim).sum();
    let key_spec = env.ctx.spec(&base_ctx)?;
    if key_spec.dim != query_dim {
        return Err(KairoError::config(format!(
            "layer {:?}: query dim {query_dim} does not match base_ctx dim {}",
            opts.name, key_spec.dim
        )));
    }
    Ok(Box::new(DotAttentionLayer {
        name: opts.name.clone(),
        sources,
        base,
        base_ctx,
        energy_factor: opts.f64("energy_factor")?.unwrap_or(1.0),
        output: env.output.clone(),
    }))
}

/// Weighted sum of `base` frames, weights from a masked softmax over the
/// scaled dot products of the query with `base_ctx`.
pub struct DotAttentionLayer {
    name: String,
    sources: Vec<LayerRef>,
    base: LayerRef,
    base_ctx: LayerRef,
    energy_factor: f64,
    output: DataSpec,
}

impl Layer for DotAttentionLayer {
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
        let mut deps = self.sources.clone();
        deps.push(self.base.clone());
        deps.push(self.base_ctx.clone());
        deps
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let sources = env.resolve_all(&self.sources)?;
        let base = env.resolve(&self.base)?;
        let keys = env.resolve(&self.base_ctx)?;
        let query = concat_features(&sources)?;
        let single_step = query.rank() == 2;
        let query = if single_step { query.unsqueeze(1)? } else { query };

        let keys_t = keys.dense_f32()?.transpose(1, 2)?.contiguous()?;
        let energies = query.contiguous()?.matmul(&keys_t)?.affine(self.energy_factor, 0.0)?;
        let mask = base.seq_mask()?.unsqueeze(1)?;
        let penalty = mask.affine(1e9, -1e9)?;
        let weights = candle_nn::ops::softmax(&energies.broadcast_add(&penalty)?, D::Minus1)?;
        let context = weights.matmul(&base.dense_f32()?.contiguous()?)?;

        if single_step {
            Data::new(self.output.clone(), context.squeeze(1)?, None)
        } else {
            Data::new(self.output.clone(), context, first_lengths(&sources))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use candle_core::{DType, Device, Tensor};
    use oorandom::Rand32;

    use super::*;
    use crate::network::layer::RunMode;

    #[test]
    fn padded_frames_get_no_weight() {
        let layer = DotAttentionLayer {
            name: "att".into(),
            sources: vec![LayerRef::Layer("q".into())],
            base: LayerRef::Layer("enc".into()),
            base_ctx: LayerRef::Layer("enc".into()),
            energy_factor: 1.0,
            output: DataSpec::dense("att", 2).without_time(),
        };
        let mut values = BTreeMap::new();
        let q = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        values.insert(
            "q".to_string(),
            Data::new(DataSpec::dense("q", 2).without_time(), q, None).unwrap(),
        );
        let enc = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0], [50.0, 50.0]]], &Device::Cpu).unwrap();
        values.insert(
            "enc".to_string(),
            Data::new(DataSpec::dense("enc", 2), enc, Some(vec![2])).unwrap(),
        );

        let externs = BTreeMap::new();
        let prev_states = BTreeMap::new();
        let mut new_states = BTreeMap::new();
        let mut rng = Rand32::new(0);
        let mut sub_losses = Vec::new();
        let mut env = ForwardEnv {
            mode: RunMode::Eval,
            step: None,
            values: &values,
            prev: None,
            base: None,
            base_rows: None,
            externs: &externs,
            unit_input: None,
            prev_states: &prev_states,
            new_states: &mut new_states,
            beam: None,
            greedy: false,
            rng: &mut rng,
            sub_losses: &mut sub_losses,
        };
        let out = layer.forward(&mut env).unwrap();
        assert_eq!(out.values.dims(), &[1, 2]);
        let out = out.values.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap();
        let w0 = 1.0f32.exp() / (1.0f32.exp() + 1.0);
        assert!((out[0][0] - w0).abs() < 1e-5);
        assert!((out[0][1] - (1.0 - w0)).abs() < 1e-5);
    }
}
