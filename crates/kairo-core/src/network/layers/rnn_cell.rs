//! LSTM weights and step function, and the `rnn_cell` layer that runs one
//! step per call inside a recurrent unit.

use candle_core::{DType, Device, Tensor};
use serde_json::Value;

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::layers::activation::sigmoid;
use crate::network::layers::linear::{dropout, l2_term, regularization};
use crate::network::params::{Init, ParamStore};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx, input_dim};
use crate::network::value::{Data, concat_features};

/// Registration of the `rnn_cell` class.
pub const CLASS: LayerClass = LayerClass {
    name: "rnn_cell",
    infer,
    build,
};

/// Cell kinds that all map to the same LSTM.
pub(crate) const LSTM_UNITS: &[&str] = &["lstm", "lstmblock", "nativelstm2", "lstmp"];

pub(crate) fn check_unit(opts: &LayerOpts, unit: &str) -> Result<()> {
    if LSTM_UNITS.contains(&unit.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(KairoError::config(format!(
            "layer {:?}: unsupported cell {unit:?}, expected one of {LSTM_UNITS:?}",
            opts.name
        )))
    }
}

/// Input weights `W (4n, in)`, recurrent weights `U (4n, n)` and bias
/// `b (4n)`; gate order input, forget, cell, output.
pub(crate) struct LstmWeights {
    w: Tensor,
    u: Tensor,
    b: Tensor,
    n: usize,
}

impl LstmWeights {
    pub(crate) fn create(
        params: &mut ParamStore,
        prefix: &str,
        n_in: usize,
        n: usize,
    ) -> Result<Self> {
        let w = params.get_or_init(
            &format!("{prefix}W"),
            &[4 * n, n_in],
            Init::Glorot {
                fan_in: n_in,
                fan_out: 4 * n,
            },
        )?;
        let u = params.get_or_init(
            &format!("{prefix}U"),
            &[4 * n, n],
            Init::Glorot {
                fan_in: n,
                fan_out: 4 * n,
            },
        )?;
        let b = params.get_or_init(&format!("{prefix}b"), &[4 * n], Init::Const(0.0))?;
        Ok(Self {
            w: w.as_tensor().clone(),
            u: u.as_tensor().clone(),
            b: b.as_tensor().clone(),
            n,
        })
    }

    pub(crate) fn n_out(&self) -> usize {
        self.n
    }

    /// `x W^T + b` for `x` of shape `(B, [T,] in)`.
    pub(crate) fn project(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.w.t()?)?.broadcast_add(&self.b)?)
    }

    /// One step from projected input `(B, 4n)`; returns `(h, c)`.
    pub(crate) fn step(&self, projected: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (projected + h.matmul(&self.u.t()?)?)?;
        let n = self.n;
        let i = sigmoid(&gates.narrow(1, 0, n)?)?;
        let f = sigmoid(&gates.narrow(1, n, n)?)?;
        let g = gates.narrow(1, 2 * n, n)?.tanh()?;
        let o = sigmoid(&gates.narrow(1, 3 * n, n)?)?;
        let c = ((f * c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok((h, c))
    }

    pub(crate) fn l2(&self, scale: f64) -> Result<Option<Tensor>> {
        l2_term(scale, &[&self.w, &self.u])
    }
}

/// Start value of one state part.
#[derive(Debug, Clone, PartialEq)]
enum InitialPart {
    Const(f32),
    Ref(LayerRef),
}

impl InitialPart {
    fn parse(opts: &LayerOpts, value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(InitialPart::Const(0.0)),
            Some(Value::Number(n)) => Ok(InitialPart::Const(n.as_f64().unwrap_or(0.0) as f32)),
            Some(Value::String(s)) => match s.as_str() {
                "zeros" => Ok(InitialPart::Const(0.0)),
                "ones" => Ok(InitialPart::Const(1.0)),
                other => match other.parse::<f32>() {
                    Ok(c) => Ok(InitialPart::Const(c)),
                    Err(_) => Ok(InitialPart::Ref(LayerRef::parse(other)?)),
                },
            },
            Some(_) => Err(KairoError::config(format!(
                "layer {:?}: invalid initial_state",
                opts.name
            ))),
        }
    }

    fn value(&self, env: &ForwardEnv<'_>, rows: usize, n: usize, device: &Device) -> Result<Tensor> {
        match self {
            InitialPart::Const(c) => Ok(Tensor::full(*c, (rows, n), device)?),
            InitialPart::Ref(r) => {
                let data = env.resolve(r)?;
                let values = data.values.to_dtype(DType::F32)?;
                if values.dims() != [rows, n] {
                    return Err(KairoError::config(format!(
                        "initial state {r} has shape {:?}, expected {:?}",
                        values.dims(),
                        [rows, n]
                    )));
                }
                Ok(values)
            }
        }
    }
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    if !ctx.in_unit() {
        return Err(KairoError::config(format!(
            "layer {:?}: rnn_cell is only valid inside a recurrent unit",
            opts.name
        )));
    }
    let n_out = opts
        .usize("n_out")?
        .ok_or_else(|| KairoError::config(format!("layer {:?} needs n_out", opts.name)))?;
    Ok(DataSpec::dense(&opts.name, n_out).without_time())
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    check_unit(opts, opts.str("unit").unwrap_or("lstm"))?;
    let sources = opts.from(true)?;
    if sources.is_empty() {
        return Err(KairoError::config(format!("layer {:?} has no sources", opts.name)));
    }
    let n_in = input_dim(&env.specs(&sources)?);
    let prefix = env.param_name(&opts.name, "");
    let weights = LstmWeights::create(env.params, &prefix, n_in, env.output.dim)?;
    let (h0, c0) = match opts.value("initial_state") {
        Some(Value::Object(parts)) => (
            InitialPart::parse(opts, parts.get("h"))?,
            InitialPart::parse(opts, parts.get("c"))?,
        ),
        other => {
            let part = InitialPart::parse(opts, other)?;
            (part.clone(), part)
        }
    };
    let (dropout, l2) = regularization(opts)?;
    Ok(Box::new(RnnCellLayer {
        name: opts.name.clone(),
        sources,
        output: env.output.clone(),
        weights,
        h0,
        c0,
        dropout,
        l2,
    }))
}

/// One LSTM step per call; state `[h, c]` is carried between steps.
pub struct RnnCellLayer {
    name: String,
    sources: Vec<LayerRef>,
    output: DataSpec,
    weights: LstmWeights,
    h0: InitialPart,
    c0: InitialPart,
    dropout: f64,
    l2: f64,
}

impl Layer for RnnCellLayer {
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
        for part in [&self.h0, &self.c0] {
            if let InitialPart::Ref(r) = part {
                deps.push(r.clone());
            }
        }
        deps
    }

    fn forward(&self, env: &mut ForwardEnv<'_>) -> Result<Data> {
        let sources = env.resolve_all(&self.sources)?;
        let mut x = concat_features(&sources)?;
        if env.mode().is_train() && self.dropout > 0.0 {
            x = dropout(&x, self.dropout, env.rng())?;
        }
        let rows = x.dim(0)?;
        let n = self.weights.n_out();
        let (h, c) = match env.prev_state(&self.name) {
            Some([h, c]) => (h.clone(), c.clone()),
            _ => (
                self.h0.value(env, rows, n, x.device())?,
                self.c0.value(env, rows, n, x.device())?,
            ),
        };
        let (h, c) = self.weights.step(&self.weights.project(&x)?, &h, &c)?;
        env.set_state(&self.name, vec![h.clone(), c]);
        Data::new(self.output.clone(), h, None)
    }

    fn l2_penalty(&self) -> Result<Option<Tensor>> {
        self.weights.l2(self.l2)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn zero_weights_give_half_gated_state() {
        let mut params = ParamStore::new(0, Device::Cpu);
        let weights = LstmWeights::create(&mut params, "cell/", 2, 3).unwrap();
        let zero_w = Tensor::zeros((12, 2), DType::F32, &Device::Cpu).unwrap();
        let zero_u = Tensor::zeros((12, 3), DType::F32, &Device::Cpu).unwrap();
        let weights = LstmWeights {
            w: zero_w,
            u: zero_u,
            ..weights
        };
        let x = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let h = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        let c = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let (h, c) = weights.step(&weights.project(&x).unwrap(), &h, &c).unwrap();
        // f = 0.5, i = 0.5, g = 0: c halves; h = 0.5 * tanh(0.5).
        let c = c.to_vec2::<f32>().unwrap();
        assert!((c[0][0] - 0.5).abs() < 1e-6);
        let h = h.to_vec2::<f32>().unwrap();
        assert!((h[0][2] - 0.5 * 0.5f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn initial_state_forms() {
        let opts = LayerOpts::new("s", &json!({"class": "rnn_cell"})).unwrap();
        assert_eq!(
            InitialPart::parse(&opts, Some(&json!(0))).unwrap(),
            InitialPart::Const(0.0)
        );
        assert_eq!(
            InitialPart::parse(&opts, Some(&json!("base:enc_state"))).unwrap(),
            InitialPart::Ref(LayerRef::Base("enc_state".into()))
        );
        assert!(InitialPart::parse(&opts, Some(&json!([1]))).is_err());
        assert!(check_unit(&opts, "LSTMBlock").is_ok());
        assert!(check_unit(&opts, "gru").is_err());
    }
}
