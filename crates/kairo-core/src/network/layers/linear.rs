//! The `linear` layer: an affine map over the concatenated sources.

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use oorandom::Rand32;

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::layers::{Activation, first_lengths, sources_have_time};
use crate::network::params::Init;
use crate::network::registry::{BuildEnv, LayerClass, NetCtx, input_dim};
use crate::network::value::{Data, concat_features};

/// Registration of the `linear` class.
pub const CLASS: LayerClass = LayerClass {
    name: "linear",
    infer,
    build,
};

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let n_out = opts
        .usize("n_out")?
        .ok_or_else(|| KairoError::config(format!("layer {:?} needs n_out", opts.name)))?;
    let sources = opts.from(ctx.in_unit())?;
    let spec = DataSpec::dense(&opts.name, n_out);
    Ok(if sources_have_time(&sources, ctx)? {
        spec
    } else {
        spec.without_time()
    })
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    Ok(Box::new(LinearLayer::create(opts, env)?))
}

/// Inverted dropout with a host-generated mask.
pub(crate) fn dropout(x: &Tensor, rate: f64, rng: &mut Rand32) -> Result<Tensor> {
    if rate <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - rate as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.rand_float() < keep { 1.0 / keep } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.shape(), x.device())?;
    Ok(x.mul(&mask)?)
}

/// `scale * Σ w²` over the given weights.
pub(crate) fn l2_term(scale: f64, weights: &[&Tensor]) -> Result<Option<Tensor>> {
    if scale <= 0.0 || weights.is_empty() {
        return Ok(None);
    }
    let mut total: Option<Tensor> = None;
    for w in weights {
        let sq = w.sqr()?.sum_all()?;
        total = Some(match total {
            Some(t) => (t + sq)?,
            None => sq,
        });
    }
    total.map(|t| Ok(t.affine(scale, 0.0)?)).transpose()
}

/// Reads `dropout` and `L2`, rejecting values outside their range.
pub(crate) fn regularization(opts: &LayerOpts) -> Result<(f64, f64)> {
    let dropout = opts.f64("dropout")?.unwrap_or(0.0);
    if !(0.0..1.0).contains(&dropout) {
        return Err(KairoError::config(format!(
            "layer {:?}: dropout must be in [0, 1)",
            opts.name
        )));
    }
    let l2 = opts.f64("L2")?.unwrap_or(0.0);
    if l2 < 0.0 {
        return Err(KairoError::config(format!(
            "layer {:?}: L2 must not be negative",
            opts.name
        )));
    }
    Ok((dropout, l2))
}

/// Affine transform, optional activation, dropout on the input in training.
pub struct LinearLayer {
    name: String,
    sources: Vec<LayerRef>,
    output: DataSpec,
    linear: Linear,
    activation: Option<Activation>,
    dropout: f64,
    l2: f64,
}

impl LinearLayer {
    /// Creates the weights `W (n_out, n_in)` and bias `b (n_out)`.
    pub(crate) fn create(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Self> {
        let sources = opts.from(env.ctx.in_unit())?;
        if sources.is_empty() {
            return Err(KairoError::config(format!("layer {:?} has no sources", opts.name)));
        }
        let n_in = input_dim(&env.specs(&sources)?);
        let n_out = env.output.dim;
        let w = env.params.get_or_init(
            &env.param_name(&opts.name, "W"),
            &[n_out, n_in],
            Init::Glorot {
                fan_in: n_in,
                fan_out: n_out,
            },
        )?;
        let b = if opts.bool("with_bias", true)? {
            let b = env
                .params
                .get_or_init(&env.param_name(&opts.name, "b"), &[n_out], Init::Const(0.0))?;
            Some(b.as_tensor().clone())
        } else {
            None
        };
        let (dropout, l2) = regularization(opts)?;
        Ok(Self {
            name: opts.name.clone(),
            sources,
            output: env.output.clone(),
            linear: Linear::new(w.as_tensor().clone(), b),
            activation: Activation::from_opts(opts)?,
            dropout,
            l2,
        })
    }

    /// Output values before any wrapping layer adds its own behavior.
    pub(crate) fn compute(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let sources = env.resolve_all(&self.sources)?;
        let mut x = concat_features(&sources)?;
        if env.mode().is_train() && self.dropout > 0.0 {
            x = dropout(&x, self.dropout, env.rng())?;
        }
        let mut y = self.linear.forward(&x)?;
        if let Some(activation) = &self.activation {
            y = activation.apply(&y)?;
        }
        let lengths = if self.output.time_axis {
            first_lengths(&sources)
        } else {
            None
        };
        Data::new(self.output.clone(), y, lengths)
    }
}

impl Layer for LinearLayer {
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
        self.compute(env)
    }

    fn l2_penalty(&self) -> Result<Option<Tensor>> {
        l2_term(self.l2, &[self.linear.weight()])
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn dropout_keeps_expectation_scale() {
        let x = Tensor::ones((4, 50), candle_core::DType::F32, &Device::Cpu).unwrap();
        let mut rng = Rand32::new(3);
        let y = dropout(&x, 0.5, &mut rng).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(values.iter().any(|&v| v == 0.0));
        assert!(values.iter().any(|&v| v == 2.0));

        let same = dropout(&x, 0.0, &mut rng).unwrap();
        assert_eq!(same.sum_all().unwrap().to_scalar::<f32>().unwrap(), 200.0);
    }

    #[test]
    fn l2_sums_squares() {
        let w = Tensor::new(&[[1.0f32, 2.0], [0.0, -1.0]], &Device::Cpu).unwrap();
        let l2 = l2_term(0.5, &[&w]).unwrap().unwrap();
        assert_eq!(l2.to_scalar::<f32>().unwrap(), 3.0);
        assert!(l2_term(0.0, &[&w]).unwrap().is_none());
    }
}
