//! The `compare` layer: elementwise comparison against a constant.

use candle_core::{DType, Tensor};

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::Data;

/// Registration of the `compare` class.
pub const CLASS: LayerClass = LayerClass {
    name: "compare",
    infer,
    build,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Kind {
    fn parse(opts: &LayerOpts) -> Result<Self> {
        match opts.str("kind").unwrap_or("equal") {
            "equal" => Ok(Kind::Equal),
            "not_equal" => Ok(Kind::NotEqual),
            "less" => Ok(Kind::Less),
            "less_equal" => Ok(Kind::LessEqual),
            "greater" => Ok(Kind::Greater),
            "greater_equal" => Ok(Kind::GreaterEqual),
            other => Err(KairoError::config(format!(
                "layer {:?}: unknown comparison {other:?}",
                opts.name
            ))),
        }
    }
}

fn single_source(opts: &LayerOpts, in_unit: bool) -> Result<LayerRef> {
    let mut sources = opts.from(in_unit)?;
    if sources.len() != 1 {
        return Err(KairoError::config(format!(
            "layer {:?}: compare takes exactly one source",
            opts.name
        )));
    }
    Ok(sources.remove(0))
}

/// Boolean result with the source's layout; sparse sources give a sparse
/// two-class result.
fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let source = ctx.spec(&single_source(opts, ctx.in_unit())?)?;
    let spec = if source.sparse {
        DataSpec::sparse(&opts.name, 2)
    } else {
        DataSpec::dense(&opts.name, source.dim)
    };
    let spec = spec.with_dtype(DType::U8);
    Ok(if source.time_axis { spec } else { spec.without_time() })
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let value = opts
        .f64("value")?
        .ok_or_else(|| KairoError::config(format!("layer {:?} needs a value", opts.name)))?;
    Ok(Box::new(CompareLayer {
        name: opts.name.clone(),
        source: single_source(opts, env.ctx.in_unit())?,
        kind: Kind::parse(opts)?,
        value,
        output: env.output.clone(),
    }))
}

pub struct CompareLayer {
    name: String,
    source: LayerRef,
    kind: Kind,
    value: f64,
    output: DataSpec,
}

impl Layer for CompareLayer {
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
        let source = env.resolve(&self.source)?;
        let x = source.values.to_dtype(DType::F64)?;
        let c = Tensor::full(self.value, x.shape(), x.device())?;
        let y = match self.kind {
            Kind::Equal => x.eq(&c)?,
            Kind::NotEqual => x.ne(&c)?,
            Kind::Less => x.lt(&c)?,
            Kind::LessEqual => x.le(&c)?,
            Kind::Greater => x.gt(&c)?,
            Kind::GreaterEqual => x.ge(&c)?,
        };
        Ok(Data::new(self.output.clone(), y, source.lengths.clone())?.with_beam(source.beam))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use candle_core::Device;
    use oorandom::Rand32;
    use serde_json::json;

    use super::*;
    use crate::network::layer::RunMode;

    #[test]
    fn compares_against_value() {
        let mut values = BTreeMap::new();
        let ids = Tensor::new(&[0u32, 3, 0], &Device::Cpu).unwrap();
        values.insert(
            "choice".to_string(),
            Data::new(DataSpec::sparse("choice", 4).without_time(), ids, None).unwrap(),
        );
        let opts = LayerOpts::new("end", &json!({"class": "compare", "from": "choice", "value": 0}))
            .unwrap();
        let layer = CompareLayer {
            name: "end".into(),
            source: single_source(&opts, true).unwrap(),
            kind: Kind::parse(&opts).unwrap(),
            value: 0.0,
            output: DataSpec::sparse("end", 2).with_dtype(DType::U8).without_time(),
        };

        let externs = BTreeMap::new();
        let prev_states = BTreeMap::new();
        let mut new_states = BTreeMap::new();
        let mut rng = Rand32::new(0);
        let mut sub_losses = Vec::new();
        let mut env = ForwardEnv {
            mode: RunMode::Eval,
            step: Some(0),
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
        assert_eq!(out.values.to_vec1::<u8>().unwrap(), vec![1, 0, 1]);

        let bad = LayerOpts::new("c", &json!({"class": "compare", "kind": "roughly"})).unwrap();
        assert!(Kind::parse(&bad).is_err());
    }
}
