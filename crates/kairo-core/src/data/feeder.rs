//! # Data Feeder
//!
//! Turns batch descriptors into padded tensors, optionally on a background
//! thread that runs ahead of compute.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Scope, ScopedJoinHandle};

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::{Receiver, bounded};
use tracing::{debug, warn};

use crate::data::batch::{Batch, BatchSlot};
use crate::data::dataset::{Dataset, Frames};
use crate::data::extern_data::{DataSpec, ExternData};
use crate::error::{KairoError, Result};

/// One padded stream of a batch.
#[derive(Debug, Clone)]
pub struct FeedTensor {
    /// Stream contract.
    pub spec: DataSpec,
    /// `(batch, time, dim)` for dense streams, `(batch, time)` for sparse.
    pub values: Tensor,
    /// True length per row, `u32` of shape `(batch,)`.
    pub lengths: Tensor,
    /// Host copy of `lengths`.
    pub lengths_host: Vec<usize>,
}

impl FeedTensor {
    /// Wraps already padded values; `lengths` are the true row lengths.
    pub fn new(spec: DataSpec, values: Tensor, lengths: Vec<usize>) -> Result<Self> {
        let (batch, time) = values.dims2().or_else(|_| {
            values.dims3().map(|(b, t, _)| (b, t))
        })?;
        if lengths.len() != batch || lengths.iter().any(|&l| l > time) {
            return Err(KairoError::data(format!(
                "stream {:?}: lengths {lengths:?} do not fit values of shape {:?}",
                spec.name,
                values.dims()
            )));
        }
        let host: Vec<u32> = lengths.iter().map(|&l| l as u32).collect();
        let lengths_tensor = Tensor::from_vec(host, batch, values.device())?;
        Ok(Self {
            spec,
            values,
            lengths: lengths_tensor,
            lengths_host: lengths,
        })
    }

    /// Longest row.
    pub fn max_len(&self) -> usize {
        self.lengths_host.iter().copied().max().unwrap_or(0)
    }

    /// Sum of the true lengths.
    pub fn num_frames(&self) -> usize {
        self.lengths_host.iter().sum()
    }
}

/// Tensors and bookkeeping for one batch.
#[derive(Debug, Clone)]
pub struct FeedDict {
    /// Padded streams by key.
    pub data: BTreeMap<String, FeedTensor>,
    /// Tag per row; merged rows join their tags with `+`.
    pub seq_tags: Vec<String>,
    /// Sequence index of the first span of each row.
    pub seq_idxs: Vec<usize>,
    /// The batch the tensors were built from.
    pub batch: Batch,
}

impl FeedDict {
    /// Looks up a stream.
    pub fn get(&self, key: &str) -> Result<&FeedTensor> {
        self.data
            .get(key)
            .ok_or_else(|| KairoError::data(format!("feed has no stream {key:?}")))
    }

    /// Number of rows.
    pub fn batch_size(&self) -> usize {
        self.seq_tags.len()
    }
}

/// Builds [`FeedDict`]s for the streams bound in an [`ExternData`].
#[derive(Clone)]
pub struct FeedBuilder<'a> {
    dataset: &'a dyn Dataset,
    specs: Vec<DataSpec>,
    device: Device,
}

impl<'a> FeedBuilder<'a> {
    /// Fails with a data error when the dataset lacks a bound stream.
    pub fn new(dataset: &'a dyn Dataset, extern_data: &ExternData, device: Device) -> Result<Self> {
        let provided = dataset.data_keys();
        let mut specs = Vec::new();
        for key in extern_data.keys() {
            if !provided.contains(&key) {
                return Err(KairoError::data(format!(
                    "dataset does not provide data key {key:?}"
                )));
            }
            let spec = extern_data.get(&key)?;
            spec.validate()?;
            specs.push(spec.clone());
        }
        Ok(Self {
            dataset,
            specs,
            device,
        })
    }

    /// Only feeds the given keys; the others are skipped.
    pub fn restrict_to(mut self, keys: &[&str]) -> Self {
        self.specs.retain(|s| keys.contains(&s.name.as_str()));
        self
    }

    /// The dataset batches are read from.
    pub fn dataset(&self) -> &'a dyn Dataset {
        self.dataset
    }

    fn slot_frames(&self, slot: &BatchSlot, key: &str) -> Result<Frames> {
        let mut merged: Option<Frames> = None;
        for span in &slot.spans {
            let frames = self.dataset.frames(span.seq_idx, key)?;
            let frames = if span.whole {
                frames
            } else {
                frames.slice(span.start, span.len)?
            };
            match merged.as_mut() {
                None => merged = Some(frames),
                Some(acc) => acc.extend(&frames)?,
            }
        }
        merged.ok_or_else(|| KairoError::data("batch slot without spans"))
    }

    fn slot_tag(&self, slot: &BatchSlot) -> Result<String> {
        let tags = slot
            .spans
            .iter()
            .map(|span| self.dataset.seq_tag(span.seq_idx))
            .collect::<Result<Vec<_>>>()?;
        Ok(tags.join("+"))
    }

    fn build_stream(&self, spec: &DataSpec, batch: &Batch) -> Result<FeedTensor> {
        let rows = batch
            .slots
            .iter()
            .map(|slot| self.slot_frames(slot, &spec.name))
            .collect::<Result<Vec<_>>>()?;
        let lengths: Vec<usize> = rows.iter().map(Frames::len).collect();
        let time = lengths.iter().copied().max().unwrap_or(0);
        let n = rows.len();

        let values = if spec.sparse {
            let mut buf = vec![spec.pad_value as u32; n * time];
            for (b, row) in rows.iter().enumerate() {
                let Frames::Sparse(ids) = row else {
                    return Err(KairoError::data(format!(
                        "stream {:?} is declared sparse but holds dense frames",
                        spec.name
                    )));
                };
                buf[b * time..b * time + ids.len()].copy_from_slice(ids);
            }
            Tensor::from_vec(buf, (n, time), &self.device)?
        } else {
            let dim = spec.dim;
            let mut buf = vec![spec.pad_value; n * time * dim];
            for (b, row) in rows.iter().enumerate() {
                match row {
                    Frames::Dense { values, dim: d } if *d == dim => {
                        let offset = b * time * dim;
                        buf[offset..offset + values.len()].copy_from_slice(values);
                    }
                    _ => {
                        return Err(KairoError::data(format!(
                            "stream {:?}: expected dense frames of dim {dim}",
                            spec.name
                        )));
                    }
                }
            }
            Tensor::from_vec(buf, (n, time, dim), &self.device)?
        };
        let native = if spec.sparse { DType::U32 } else { DType::F32 };
        let values = if spec.dtype != native {
            values.to_dtype(spec.dtype)?
        } else {
            values
        };
        FeedTensor::new(spec.clone(), values, lengths)
    }

    /// Pads every bound stream of the batch.
    pub fn build(&self, batch: &Batch) -> Result<FeedDict> {
        let mut data = BTreeMap::new();
        for spec in &self.specs {
            data.insert(spec.name.clone(), self.build_stream(spec, batch)?);
        }
        let seq_tags = batch
            .slots
            .iter()
            .map(|slot| self.slot_tag(slot))
            .collect::<Result<Vec<_>>>()?;
        let seq_idxs = batch
            .slots
            .iter()
            .filter_map(|slot| slot.spans.first().map(|s| s.seq_idx))
            .collect();
        Ok(FeedDict {
            data,
            seq_tags,
            seq_idxs,
            batch: batch.clone(),
        })
    }
}

/// Background producer of [`FeedDict`]s over a bounded queue.
///
/// Feeds arrive in generator order. Dropping the provider stops and joins
/// the producer thread.
pub struct DataProvider<'scope> {
    receiver: Option<Receiver<Result<FeedDict>>>,
    stop: Arc<AtomicBool>,
    handle: Option<ScopedJoinHandle<'scope, usize>>,
}

impl<'scope> DataProvider<'scope> {
    /// Spawns the producer inside `scope`. The producer blocks once
    /// `queue_size` feeds are waiting.
    pub fn start<'env, I>(
        scope: &'scope Scope<'scope, 'env>,
        builder: FeedBuilder<'scope>,
        batches: I,
        queue_size: usize,
    ) -> Self
    where
        I: IntoIterator<Item = Result<Batch>>,
        I::IntoIter: Send + 'scope,
    {
        let (sender, receiver) = bounded(queue_size.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let producer_stop = Arc::clone(&stop);
        let batches = batches.into_iter();
        let handle = scope.spawn(move || {
            let mut produced = 0usize;
            for batch in batches {
                if producer_stop.load(Ordering::Acquire) {
                    break;
                }
                let item = batch.and_then(|b| builder.build(&b));
                let failed = item.is_err();
                if sender.send(item).is_err() || failed {
                    break;
                }
                produced += 1;
            }
            produced
        });
        Self {
            receiver: Some(receiver),
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the producer and waits for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Closing the channel unblocks a producer waiting on a full queue.
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(produced) => debug!(produced, "data provider stopped"),
                Err(_) => warn!("data provider thread panicked"),
            }
        }
    }

    /// Whether the producer has been joined.
    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }
}

impl Iterator for DataProvider<'_> {
    type Item = Result<FeedDict>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.receiver.as_ref()?.recv().ok();
        if item.is_none() {
            self.stop();
        }
        item
    }
}

impl Drop for DataProvider<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::data::batch::{BatchSetGenerator, BatchingConfig};
    use crate::data::dataset::{DummyDataset, SeqRecord, StaticDataset};

    fn two_seq_dataset() -> StaticDataset {
        let seq = |tag: &str, feats: Vec<f32>, labels: Vec<u32>| SeqRecord {
            tag: tag.to_string(),
            streams: BTreeMap::from([
                (
                    "data".to_string(),
                    Frames::Dense {
                        values: feats,
                        dim: 2,
                    },
                ),
                ("classes".to_string(), Frames::Sparse(labels)),
            ]),
        };
        StaticDataset::new(
            vec![
                DataSpec::dense("data", 2).with_pad_value(-1.0),
                DataSpec::sparse("classes", 3),
            ],
            vec![
                seq("a", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![0, 1, 2]),
                seq("b", vec![7.0, 8.0], vec![2]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn build_pads_to_longest_row() {
        let dataset = two_seq_dataset();
        let mut extern_data = ExternData::new();
        extern_data.init_from_dataset(&dataset).unwrap();
        let builder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
        let batch = BatchSetGenerator::new(
            &dataset,
            BatchingConfig {
                batch_size: 100,
                ..Default::default()
            },
        )
        .unwrap()
        .next()
        .unwrap()
        .unwrap();

        let feed = builder.build(&batch).unwrap();
        assert_eq!(feed.seq_tags, vec!["a", "b"]);

        let data = feed.get("data").unwrap();
        assert_eq!(data.values.dims(), &[2, 3, 2]);
        assert_eq!(data.lengths.to_vec1::<u32>().unwrap(), vec![3, 1]);
        let rows = data.values.to_vec3::<f32>().unwrap();
        assert_eq!(rows[1][0], vec![7.0, 8.0]);
        assert_eq!(rows[1][2], vec![-1.0, -1.0]);

        let classes = feed.get("classes").unwrap();
        assert_eq!(classes.values.dims(), &[2, 3]);
        assert_eq!(classes.values.to_vec2::<u32>().unwrap()[1], vec![2, 0, 0]);
        assert_eq!(classes.num_frames(), 4);
    }

    #[test]
    fn missing_key_is_data_error() {
        let dataset = DummyDataset::new(2, 3, 2, 5);
        let mut extern_data = ExternData::new();
        extern_data.register(DataSpec::dense("speaker", 4));
        assert!(matches!(
            FeedBuilder::new(&dataset, &extern_data, Device::Cpu),
            Err(KairoError::Data(_))
        ));
    }

    #[test]
    fn provider_yields_in_order() {
        let dataset = DummyDataset::new(2, 3, 6, 2);
        let mut extern_data = ExternData::new();
        extern_data.init_from_dataset(&dataset).unwrap();
        let builder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
        let batches = BatchSetGenerator::new(
            &dataset,
            BatchingConfig {
                batch_size: 4,
                ..Default::default()
            },
        )
        .unwrap();

        let tags: Vec<Vec<String>> = std::thread::scope(|scope| {
            DataProvider::start(scope, builder, batches, 1)
                .map(|feed| feed.unwrap().seq_tags)
                .collect()
        });
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0], vec!["seq-0", "seq-1"]);
        assert_eq!(tags[2], vec!["seq-4", "seq-5"]);
    }

    #[test]
    fn stopping_early_joins_producer() {
        let dataset = DummyDataset::new(2, 3, 50, 2);
        let mut extern_data = ExternData::new();
        extern_data.init_from_dataset(&dataset).unwrap();
        let builder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
        let batches = BatchSetGenerator::new(&dataset, BatchingConfig::default()).unwrap();

        std::thread::scope(|scope| {
            let mut provider = DataProvider::start(scope, builder, batches, 1);
            assert!(provider.next().unwrap().is_ok());
            provider.stop();
            assert!(provider.is_stopped());
            assert!(provider.next().is_none());
        });
    }

    #[test]
    fn chunked_rows_are_sliced() {
        let dataset = DummyDataset::new(1, 3, 1, 5);
        let mut extern_data = ExternData::new();
        extern_data.init_from_dataset(&dataset).unwrap();
        let builder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
        let batch = BatchSetGenerator::new(
            &dataset,
            BatchingConfig {
                batch_size: 6,
                chunking: Some((3, 3)),
                ..Default::default()
            },
        )
        .unwrap()
        .next()
        .unwrap()
        .unwrap();

        let feed = builder.build(&batch).unwrap();
        let classes = feed.get("classes").unwrap();
        assert_eq!(classes.lengths_host, vec![3, 2]);
        // Labels of seq 0 with dim 1 start at k = 5.
        assert_eq!(
            classes.values.to_vec2::<u32>().unwrap(),
            vec![vec![2, 0, 1], vec![2, 0, 0]]
        );
    }
}
