//! Runtime values flowing between layers.

use std::sync::Arc;

use candle_core::{D, DType, Tensor};

use crate::data::extern_data::DataSpec;
use crate::data::feeder::FeedTensor;
use crate::error::{KairoError, Result};

/// Hypothesis bookkeeping attached to values produced under beam search.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamInfo {
    /// Hypotheses per original batch row.
    pub width: usize,
    /// Cumulative log-probability per row.
    pub scores: Vec<f32>,
    /// Original batch row of each row.
    pub batch_rows: Vec<u32>,
}

/// A layer output or fed stream: padded values plus true lengths.
#[derive(Debug, Clone)]
pub struct Data {
    /// Shape contract.
    pub spec: DataSpec,
    /// `(batch, [time,] [dim])` values.
    pub values: Tensor,
    /// `u32` size tensor of shape `(batch,)` when there is a time axis.
    pub sizes: Option<Tensor>,
    /// Host copy of `sizes`.
    pub lengths: Option<Vec<usize>>,
    /// Present when rows are beam hypotheses.
    pub beam: Option<Arc<BeamInfo>>,
}

impl Data {
    /// Wraps values, validating lengths against the padded time axis.
    pub fn new(spec: DataSpec, values: Tensor, lengths: Option<Vec<usize>>) -> Result<Self> {
        let batch = values.dim(0)?;
        let sizes = match (&lengths, spec.time_axis) {
            (Some(lengths), true) => {
                let time = values.dim(1)?;
                if lengths.len() != batch || lengths.iter().any(|&l| l > time) {
                    return Err(KairoError::config(format!(
                        "{:?}: lengths {lengths:?} do not fit shape {:?}",
                        spec.name,
                        values.dims()
                    )));
                }
                let host: Vec<u32> = lengths.iter().map(|&l| l as u32).collect();
                Some(Tensor::from_vec(host, batch, values.device())?)
            }
            (None, false) => None,
            (None, true) => {
                return Err(KairoError::config(format!(
                    "{:?} has a time axis but no lengths",
                    spec.name
                )));
            }
            (Some(_), false) => {
                return Err(KairoError::config(format!(
                    "{:?} has lengths but no time axis",
                    spec.name
                )));
            }
        };
        Ok(Self {
            spec,
            values,
            sizes,
            lengths,
            beam: None,
        })
    }

    /// Value of a fed stream.
    pub fn from_feed(feed: &FeedTensor) -> Self {
        Self {
            spec: feed.spec.clone(),
            values: feed.values.clone(),
            sizes: Some(feed.lengths.clone()),
            lengths: Some(feed.lengths_host.clone()),
            beam: None,
        }
    }

    /// Attaches beam bookkeeping.
    pub fn with_beam(mut self, beam: Option<Arc<BeamInfo>>) -> Self {
        self.beam = beam;
        self
    }

    /// Number of rows.
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.values.dim(0)?)
    }

    /// Padded time length, if there is a time axis.
    pub fn time_len(&self) -> Result<Option<usize>> {
        if self.spec.time_axis {
            Ok(Some(self.values.dim(1)?))
        } else {
            Ok(None)
        }
    }

    /// `(batch, time)` f32 mask of valid frames.
    pub fn seq_mask(&self) -> Result<Tensor> {
        let (Some(sizes), Some(time)) = (&self.sizes, self.time_len()?) else {
            return Err(KairoError::config(format!(
                "{:?} has no time axis to mask",
                self.spec.name
            )));
        };
        let steps = Tensor::arange(0u32, time as u32, self.values.device())?.unsqueeze(0)?;
        Ok(steps
            .broadcast_lt(&sizes.unsqueeze(1)?)?
            .to_dtype(DType::F32)?)
    }

    /// Total number of valid frames, or rows without a time axis.
    pub fn num_frames(&self) -> Result<usize> {
        match &self.lengths {
            Some(lengths) => Ok(lengths.iter().sum()),
            None => self.batch_size(),
        }
    }

    /// Rows gathered by index, for beam reordering and tiling.
    pub fn select_rows(&self, rows: &[u32]) -> Result<Data> {
        let index = Tensor::new(rows, self.values.device())?;
        let values = self.values.index_select(&index, 0)?;
        let lengths = self
            .lengths
            .as_ref()
            .map(|l| rows.iter().map(|&r| l[r as usize]).collect());
        Data::new(self.spec.clone(), values, lengths)
    }

    /// The frame at step `t`, without time axis. Steps past the padded end
    /// yield pad values.
    pub fn frame(&self, t: usize) -> Result<Data> {
        let time = self.time_len()?.ok_or_else(|| {
            KairoError::config(format!("{:?} has no time axis", self.spec.name))
        })?;
        let values = if t < time {
            self.values.narrow(1, t, 1)?.squeeze(1)?
        } else {
            let mut shape = self.values.dims().to_vec();
            shape.remove(1);
            Tensor::full(self.spec.pad_value, shape, self.values.device())?
                .to_dtype(self.values.dtype())?
        };
        Data::new(self.spec.clone().without_time(), values, None)
    }

    /// Values as f32 with a trailing feature axis: sparse `(batch, [time])`
    /// become one-hot `(batch, [time], dim)`.
    pub fn dense_f32(&self) -> Result<Tensor> {
        if !self.spec.sparse {
            return Ok(self.values.to_dtype(DType::F32)?);
        }
        let classes = Tensor::arange(0u32, self.spec.dim as u32, self.values.device())?;
        let ids = self.values.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
        Ok(ids
            .broadcast_eq(&classes.reshape(broadcast_shape(ids.rank(), self.spec.dim))?)?
            .to_dtype(DType::F32)?)
    }
}

fn broadcast_shape(rank: usize, dim: usize) -> Vec<usize> {
    let mut shape = vec![1; rank];
    if let Some(last) = shape.last_mut() {
        *last = dim;
    }
    shape
}

/// Concatenates values along the feature axis. All inputs must share the
/// batch and time layout.
pub fn concat_features(sources: &[Data]) -> Result<Tensor> {
    match sources {
        [] => Err(KairoError::config("layer has no sources")),
        [single] => single.dense_f32(),
        many => {
            let parts = many
                .iter()
                .map(Data::dense_f32)
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::cat(&parts, D::Minus1)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn mask_and_frames() {
        let values = Tensor::arange(0f32, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 1))
            .unwrap();
        let data = Data::new(DataSpec::dense("x", 1), values, Some(vec![3, 1])).unwrap();
        assert_eq!(
            data.seq_mask().unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 0.0]]
        );
        assert_eq!(data.num_frames().unwrap(), 4);

        let frame = data.frame(1).unwrap();
        assert!(!frame.spec.time_axis);
        assert_eq!(frame.values.to_vec2::<f32>().unwrap(), vec![vec![1.0], vec![4.0]]);
        let past = data.frame(5).unwrap();
        assert_eq!(past.values.to_vec2::<f32>().unwrap(), vec![vec![0.0], vec![0.0]]);
    }

    #[test]
    fn lengths_must_fit() {
        let values = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(Data::new(DataSpec::sparse("y", 4), values.clone(), Some(vec![4, 1])).is_err());
        assert!(Data::new(DataSpec::sparse("y", 4), values, None).is_err());
    }

    #[test]
    fn one_hot_and_row_selection() {
        let ids = Tensor::new(&[[2u32, 0], [1, 1]], &Device::Cpu).unwrap();
        let data = Data::new(DataSpec::sparse("y", 3), ids, Some(vec![2, 1])).unwrap();
        let one_hot = data.dense_f32().unwrap();
        assert_eq!(one_hot.dims(), &[2, 2, 3]);
        assert_eq!(
            one_hot.to_vec3::<f32>().unwrap()[0],
            vec![vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0]]
        );

        let picked = data.select_rows(&[1, 1, 0]).unwrap();
        assert_eq!(picked.lengths, Some(vec![1, 1, 2]));
        assert_eq!(picked.values.dims(), &[3, 2]);
    }
}
