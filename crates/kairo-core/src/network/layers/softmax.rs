//! The `softmax` output layer with its cross-entropy loss.

use candle_core::{D, DType, Tensor};

use crate::data::extern_data::{DEFAULT_TARGET_KEY, DataSpec};
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef, LossValue};
use crate::network::layers::linear::LinearLayer;
use crate::network::layers::sources_have_time;
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::Data;

/// Registration of the `softmax` class.
pub const CLASS: LayerClass = LayerClass {
    name: "softmax",
    infer,
    build,
};

/// Loss key and target key of a layer; a loss without explicit target uses
/// the default target stream.
fn loss_target(opts: &LayerOpts) -> Result<Option<String>> {
    match opts.str("loss") {
        None => Ok(opts.str("target").map(str::to_string)),
        Some("ce") => Ok(Some(
            opts.str("target").unwrap_or(DEFAULT_TARGET_KEY).to_string(),
        )),
        Some(other) => Err(KairoError::config(format!(
            "layer {:?}: unsupported loss {other:?} for softmax",
            opts.name
        ))),
    }
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let n_out = match opts.usize("n_out")? {
        Some(n) => n,
        None => {
            let target = loss_target(opts)?.unwrap_or_else(|| DEFAULT_TARGET_KEY.to_string());
            ctx.spec(&LayerRef::Data(target))
                .map_err(|e| {
                    KairoError::config(format!(
                        "layer {:?}: no n_out and no target to take it from ({e})",
                        opts.name
                    ))
                })?
                .dim
        }
    };
    let sources = opts.from(ctx.in_unit())?;
    let spec = DataSpec::dense(&opts.name, n_out);
    Ok(if sources_have_time(&sources, ctx)? {
        spec
    } else {
        spec.without_time()
    })
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    if opts.value("activation").is_some() {
        return Err(KairoError::config(format!(
            "layer {:?}: softmax takes no activation",
            opts.name
        )));
    }
    let target = loss_target(opts)?;
    let has_loss = opts.str("loss").is_some();
    Ok(Box::new(SoftmaxLayer {
        linear: LinearLayer::create(opts, env)?,
        target: if has_loss { target } else { None },
    }))
}

/// Class posteriors over the last axis.
pub struct SoftmaxLayer {
    linear: LinearLayer,
    target: Option<String>,
}

impl Layer for SoftmaxLayer {
    fn name(&self) -> &str {
        self.linear.name()
    }

    fn class(&self) -> &'static str {
        CLASS.name
    }

    fn output_spec(&self) -> &DataSpec {
        self.linear.output_spec()
    }

    fn dependencies(&self) -> Vec<LayerRef> {
        self.linear.dependencies()
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let logits = self.linear.compute(env)?;
        let probs = candle_nn::ops::softmax(&logits.values, D::Minus1)?;
        Ok(Data { values: probs, ..logits })
    }

    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn loss(&self, output: &Data, target: &Data) -> Result<Option<LossValue>> {
        cross_entropy(self.linear.name(), output, target).map(Some)
    }

    fn l2_penalty(&self) -> Result<Option<Tensor>> {
        self.linear.l2_penalty()
    }
}

/// Summed cross entropy and frame error count of posteriors `(B, [T,] C)`
/// against sparse targets `(B, [T])`, over the target's valid frames.
pub fn cross_entropy(layer: &str, output: &Data, target: &Data) -> Result<LossValue> {
    if !target.spec.sparse {
        return Err(KairoError::data(format!(
            "layer {layer:?}: cross entropy needs a sparse target, {:?} is dense",
            target.spec.name
        )));
    }
    let out_dims = output.values.dims();
    let tgt_dims = target.values.dims();
    if out_dims.len() != tgt_dims.len() + 1 || out_dims[..tgt_dims.len()] != *tgt_dims {
        return Err(KairoError::data(format!(
            "layer {layer:?}: output shape {out_dims:?} does not match target {:?} shape {tgt_dims:?}",
            target.spec.name
        )));
    }
    let ids = target.values.to_dtype(DType::U32)?;
    let mask = if target.spec.time_axis {
        target.seq_mask()?
    } else {
        Tensor::ones(tgt_dims, DType::F32, target.values.device())?
    };
    let log_probs = output.values.clamp(1e-10f32, 1f32)?.log()?;
    let picked = log_probs
        .gather(&ids.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let loss = picked.mul(&mask)?.sum_all()?.neg()?;

    let wrong = output
        .values
        .argmax(D::Minus1)?
        .ne(&ids)?
        .to_dtype(DType::F32)?
        .mul(&mask)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(LossValue {
        loss: Some(loss),
        error: Some(wrong as f64),
        frames: target.num_frames()?,
    })
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn cross_entropy_masks_padding() {
        let probs = Tensor::new(
            &[[[0.6f32, 0.4], [0.9, 0.1]], [[0.2, 0.8], [0.5, 0.5]]],
            &Device::Cpu,
        )
        .unwrap();
        let output = Data::new(DataSpec::dense("out", 2), probs, Some(vec![2, 1])).unwrap();
        let ids = Tensor::new(&[[0u32, 1], [1, 0]], &Device::Cpu).unwrap();
        let target = Data::new(DataSpec::sparse("classes", 2), ids, Some(vec![2, 1])).unwrap();

        let lv = cross_entropy("out", &output, &target).unwrap();
        assert_eq!(lv.frames, 3);
        let expected = -(0.6f64.ln() + 0.1f64.ln() + 0.8f64.ln());
        assert!((lv.loss_sum().unwrap().unwrap() - expected).abs() < 1e-4);
        assert_eq!(lv.error, Some(1.0));
    }

    #[test]
    fn shape_mismatch_is_data_error() {
        let probs = Tensor::ones((1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let output = Data::new(DataSpec::dense("out", 2), probs, Some(vec![3])).unwrap();
        let ids = Tensor::zeros((1, 2), DType::U32, &Device::Cpu).unwrap();
        let target = Data::new(DataSpec::sparse("classes", 2), ids, Some(vec![2])).unwrap();
        assert!(matches!(
            cross_entropy("out", &output, &target),
            Err(KairoError::Data(_))
        ));
    }
}
