//! Elementwise activation functions and the `activation` layer.

use std::sync::OnceLock;

use candle_core::{D, DType, Tensor};
use regex::Regex;
use serde_json::Value;

use crate::data::extern_data::{DataSpec, parse_dtype};
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::layers::first_lengths;
use crate::network::registry::{BuildEnv, LayerClass, NetCtx, combined_spec};
use crate::network::value::{Data, concat_features};

/// Registration of the `activation` class.
pub const CLASS: LayerClass = LayerClass {
    name: "activation",
    infer,
    build,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Identity,
    Tanh,
    Relu,
    Sigmoid,
    Exp,
    Log,
    Abs,
    Softmax,
    LogSoftmax,
}

/// An elementwise function with an optional `+ c` or `* c` suffix, e.g.
/// `tanh`, `identity + 1`, `relu * 0.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activation {
    kind: Kind,
    add: f64,
    mul: f64,
}

fn expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([a-z_]+)\s*(?:([+*])\s*(-?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?))?\s*$")
            .unwrap_or_else(|e| panic!("activation pattern: {e}"))
    })
}

impl Activation {
    /// Parses an activation expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let caps = expression()
            .captures(expr)
            .ok_or_else(|| KairoError::config(format!("invalid activation {expr:?}")))?;
        let kind = match &caps[1] {
            "identity" | "linear" => Kind::Identity,
            "tanh" => Kind::Tanh,
            "relu" => Kind::Relu,
            "sigmoid" => Kind::Sigmoid,
            "exp" => Kind::Exp,
            "log" => Kind::Log,
            "abs" => Kind::Abs,
            "softmax" => Kind::Softmax,
            "log_softmax" => Kind::LogSoftmax,
            other => {
                return Err(KairoError::config(format!("unknown activation {other:?}")));
            }
        };
        let (mut add, mut mul) = (0.0, 1.0);
        if let (Some(op), Some(num)) = (caps.get(2), caps.get(3)) {
            let c: f64 = num
                .as_str()
                .parse()
                .map_err(|_| KairoError::config(format!("invalid constant in {expr:?}")))?;
            match op.as_str() {
                "+" => add = c,
                _ => mul = c,
            }
        }
        Ok(Self { kind, add, mul })
    }

    /// Reads an `activation` option; absent or `null` means none.
    pub fn from_opts(opts: &LayerOpts) -> Result<Option<Self>> {
        match opts.value("activation") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Self::parse(s).map(Some),
            Some(_) => Err(KairoError::config(format!(
                "layer {:?}: activation must be a string",
                opts.name
            ))),
        }
    }

    /// Applies the function to f32 values.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let y = match self.kind {
            Kind::Identity => x.clone(),
            Kind::Tanh => x.tanh()?,
            Kind::Relu => x.relu()?,
            Kind::Sigmoid => sigmoid(x)?,
            Kind::Exp => x.exp()?,
            Kind::Log => x.log()?,
            Kind::Abs => x.abs()?,
            Kind::Softmax => candle_nn::ops::softmax(x, D::Minus1)?,
            Kind::LogSoftmax => candle_nn::ops::log_softmax(x, D::Minus1)?,
        };
        if self.add == 0.0 && self.mul == 1.0 {
            Ok(y)
        } else {
            Ok(y.affine(self.mul, self.add)?)
        }
    }
}

/// Logistic function built from differentiable primitives.
pub(crate) fn sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok((x.neg()?.exp()? + 1.0)?.recip()?)
}

/// `out_type` overrides: `(dim, dtype, sparse)`.
fn out_type(opts: &LayerOpts) -> Result<Option<(Option<usize>, Option<DType>, bool)>> {
    let Some(value) = opts.value("out_type") else {
        return Ok(None);
    };
    let obj = value.as_object().ok_or_else(|| {
        KairoError::config(format!("layer {:?}: out_type must be an object", opts.name))
    })?;
    let dim = obj.get("dim").and_then(Value::as_u64).map(|d| d as usize);
    let dtype = obj
        .get("dtype")
        .and_then(Value::as_str)
        .map(parse_dtype)
        .transpose()?;
    let sparse = obj.get("sparse").and_then(Value::as_bool).unwrap_or(false);
    Ok(Some((dim, dtype, sparse)))
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let sources = opts.from(ctx.in_unit())?;
    if let Some((Some(dim), dtype, sparse)) = out_type(opts)? {
        let mut spec = if sparse {
            DataSpec::sparse(&opts.name, dim)
        } else {
            DataSpec::dense(&opts.name, dim)
        };
        if let Some(dtype) = dtype {
            spec = spec.with_dtype(dtype);
        }
        if ctx.in_unit() {
            return Ok(spec.without_time());
        }
        let first = sources
            .first()
            .ok_or_else(|| KairoError::config(format!("layer {:?} has no sources", opts.name)))?;
        let time_axis = ctx.spec(first)?.time_axis;
        return Ok(if time_axis { spec } else { spec.without_time() });
    }
    let specs = sources
        .iter()
        .map(|s| ctx.spec(s))
        .collect::<Result<Vec<_>>>()?;
    let mut spec = combined_spec(&opts.name, &specs)?;
    if let Some((_, Some(dtype), _)) = out_type(opts)? {
        spec = spec.with_dtype(dtype);
    } else if specs.len() == 1 && !spec.sparse {
        spec = spec.with_dtype(DType::F32);
    }
    Ok(spec)
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let sources = opts.from(env.ctx.in_unit())?;
    if sources.is_empty() {
        return Err(KairoError::config(format!("layer {:?} has no sources", opts.name)));
    }
    let activation = Activation::from_opts(opts)?.unwrap_or(Activation {
        kind: Kind::Identity,
        add: 0.0,
        mul: 1.0,
    });
    let specs = env.specs(&sources)?;
    let input_width: usize = if specs.len() == 1 && specs[0].sparse {
        1
    } else {
        specs.iter().map(|s| s.dim).sum()
    };
    let out_width = if env.output.sparse { 1 } else { env.output.dim };
    if input_width != out_width {
        return Err(KairoError::config(format!(
            "layer {:?}: elementwise activation cannot map width {input_width} to {out_width}",
            opts.name
        )));
    }
    Ok(Box::new(ActivationLayer {
        name: opts.name.clone(),
        sources,
        activation,
        output: env.output.clone(),
    }))
}

/// Applies an [`Activation`] to its (concatenated) sources.
pub struct ActivationLayer {
    name: String,
    sources: Vec<LayerRef>,
    activation: Activation,
    output: DataSpec,
}

impl Layer for ActivationLayer {
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
        let sources = env.resolve_all(&self.sources)?;
        let x = match sources.as_slice() {
            [single] => single.values.to_dtype(DType::F32)?,
            many => concat_features(many)?,
        };
        let mut y = self.activation.apply(&x)?;
        // Sparse sources carry no feature axis; a dense result needs one.
        if !self.output.sparse && y.rank() < x.rank() + 1 && sources.len() == 1 && sources[0].spec.sparse {
            y = y.unsqueeze(D::Minus1)?;
        }
        let y = y.to_dtype(self.output.dtype)?;
        let lengths = if self.output.time_axis {
            first_lengths(&sources)
        } else {
            None
        };
        Data::new(self.output.clone(), y, lengths)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn parse_expressions() {
        let act = Activation::parse("identity + 1").unwrap();
        assert_eq!(act.kind, Kind::Identity);
        assert_eq!(act.add, 1.0);
        let act = Activation::parse("tanh*0.5").unwrap();
        assert_eq!(act.mul, 0.5);
        assert!(Activation::parse("gelu").is_err());
        assert!(Activation::parse("relu +").is_err());
    }

    #[test]
    fn apply_functions() {
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &Device::Cpu).unwrap();
        let relu = Activation::parse("relu").unwrap().apply(&x).unwrap();
        assert_eq!(relu.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 2.0]);

        let sig = Activation::parse("sigmoid").unwrap().apply(&x).unwrap();
        let sig = sig.to_vec1::<f32>().unwrap();
        assert!((sig[1] - 0.5).abs() < 1e-6);
        assert!((sig[2] - 1.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);

        let shifted = Activation::parse("identity + 1").unwrap().apply(&x).unwrap();
        assert_eq!(shifted.to_vec1::<f32>().unwrap(), vec![0.0, 1.0, 3.0]);

        let probs = Activation::parse("softmax").unwrap().apply(&x).unwrap();
        let total: f32 = probs.to_vec1::<f32>().unwrap().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
