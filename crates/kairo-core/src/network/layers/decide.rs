//! The `decide` layer: collapses a beam to the best hypothesis per batch
//! row, optionally scored by edit distance against a target.

use std::sync::Arc;

use candle_core::DType;

use crate::data::extern_data::{DEFAULT_TARGET_KEY, DataSpec};
use crate::error::{KairoError, Result};
use crate::network::beam::best_rows;
use crate::network::layer::{ForwardEnv, Layer, LayerOpts, LayerRef, LossValue};
use crate::network::registry::{BuildEnv, LayerClass, NetCtx};
use crate::network::value::{BeamInfo, Data};

/// Registration of the `decide` class.
pub const CLASS: LayerClass = LayerClass {
    name: "decide",
    infer,
    build,
};

fn single_source(opts: &LayerOpts, in_unit: bool) -> Result<LayerRef> {
    let mut sources = opts.from(in_unit)?;
    if sources.len() != 1 {
        return Err(KairoError::config(format!(
            "layer {:?}: decide takes exactly one source",
            opts.name
        )));
    }
    Ok(sources.remove(0))
}

fn infer(opts: &LayerOpts, ctx: &mut dyn NetCtx) -> Result<DataSpec> {
    let source = single_source(opts, ctx.in_unit())?;
    Ok(ctx.spec(&source)?.renamed(&opts.name))
}

fn build(opts: &LayerOpts, env: &mut BuildEnv<'_>) -> Result<Box<dyn Layer>> {
    let target = match opts.str("loss") {
        None => None,
        Some("edit_distance") => {
            if !env.output.sparse {
                return Err(KairoError::config(format!(
                    "layer {:?}: edit distance needs label sequences",
                    opts.name
                )));
            }
            Some(opts.str("target").unwrap_or(DEFAULT_TARGET_KEY).to_string())
        }
        Some(other) => {
            return Err(KairoError::config(format!(
                "layer {:?}: unsupported loss {other:?} for decide",
                opts.name
            )));
        }
    };
    Ok(Box::new(DecideLayer {
        name: opts.name.clone(),
        source: single_source(opts, env.ctx.in_unit())?,
        target,
        output: env.output.clone(),
    }))
}

pub struct DecideLayer {
    name: String,
    source: LayerRef,
    target: Option<String>,
    output: DataSpec,
}

impl Layer for DecideLayer {
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
        let mut source = env.resolve(&self.source)?;
        source.spec = self.output.clone();
        let Some(info) = source.beam.clone() else {
            return Ok(source);
        };
        if info.width <= 1 {
            return Ok(source);
        }
        let rows = best_rows(&info);
        let picked = source.select_rows(&rows)?;
        let beam = BeamInfo {
            width: 1,
            scores: rows.iter().map(|&r| info.scores[r as usize]).collect(),
            batch_rows: rows.iter().map(|&r| info.batch_rows[r as usize]).collect(),
        };
        Ok(picked.with_beam(Some(Arc::new(beam))))
    }

    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn loss(&self, output: &Data, target: &Data) -> Result<Option<LossValue>> {
        let hyps = label_seqs(output)?;
        let refs = label_seqs(target)?;
        if hyps.len() != refs.len() {
            return Err(KairoError::data(format!(
                "layer {:?}: {} hypotheses for {} targets",
                self.name,
                hyps.len(),
                refs.len()
            )));
        }
        let distance: usize = hyps
            .iter()
            .zip(&refs)
            .map(|(h, r)| edit_distance(h, r))
            .sum();
        Ok(Some(LossValue {
            loss: None,
            error: Some(distance as f64),
            frames: refs.iter().map(Vec::len).sum(),
        }))
    }
}

/// Label rows of a sparse value, each cut to its length.
fn label_seqs(data: &Data) -> Result<Vec<Vec<u32>>> {
    let values = data.values.to_dtype(DType::U32)?;
    let rows: Vec<Vec<u32>> = if data.spec.time_axis {
        values.to_vec2()?
    } else {
        values.to_vec1::<u32>()?.into_iter().map(|l| vec![l]).collect()
    };
    Ok(match &data.lengths {
        Some(lengths) => rows
            .into_iter()
            .zip(lengths)
            .map(|(mut row, &len)| {
                row.truncate(len);
                row
            })
            .collect(),
        None => rows,
    })
}

/// Levenshtein distance with unit costs.
pub fn edit_distance(a: &[u32], b: &[u32]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(x != y);
            cur[j + 1] = substitute.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    #[test]
    fn levenshtein() {
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 2, 3]), 0);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 3]), 1);
        assert_eq!(edit_distance(&[], &[4, 4]), 2);
        assert_eq!(edit_distance(&[1, 2], &[2, 1]), 2);
    }

    #[test]
    fn loss_counts_distance_over_target_frames() {
        let layer = DecideLayer {
            name: "decision".into(),
            source: LayerRef::Layer("output".into()),
            target: Some("classes".into()),
            output: DataSpec::sparse("decision", 5),
        };
        let hyp = Tensor::new(&[[1u32, 2, 0], [3, 0, 0]], &Device::Cpu).unwrap();
        let hyp = Data::new(DataSpec::sparse("decision", 5), hyp, Some(vec![3, 1])).unwrap();
        let tgt = Tensor::new(&[[1u32, 2], [4, 4]], &Device::Cpu).unwrap();
        let tgt = Data::new(DataSpec::sparse("classes", 5), tgt, Some(vec![2, 2])).unwrap();

        let lv = layer.loss(&hyp, &tgt).unwrap().unwrap();
        assert!(lv.loss.is_none());
        assert_eq!(lv.frames, 4);
        assert_eq!(lv.error, Some(3.0));
    }
}
