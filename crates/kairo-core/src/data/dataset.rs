//! # Sequence Datasets
//!
//! The [`Dataset`] trait is the contract the batch assembler and the feeder
//! consume: sequences addressed by their position in the current epoch
//! order, each with one frame array per named stream.

use std::collections::BTreeMap;

use oorandom::Rand64;

use crate::config::Config;
use crate::data::extern_data::{DataSpec, DEFAULT_INPUT_KEY, DEFAULT_TARGET_KEY};
use crate::error::{KairoError, Result};

/// Frames of one sequence in one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frames {
    /// Row-major `(time, dim)` feature matrix.
    Dense { values: Vec<f32>, dim: usize },
    /// One class index per frame.
    Sparse(Vec<u32>),
}

impl Frames {
    /// Number of frames.
    pub fn len(&self) -> usize {
        match self {
            Frames::Dense { values, dim } => {
                if *dim == 0 { 0 } else { values.len() / dim }
            }
            Frames::Sparse(ids) => ids.len(),
        }
    }

    /// Whether there are no frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> Result<Frames> {
        if start + len > self.len() {
            return Err(KairoError::data(format!(
                "frame range {start}..{} out of bounds for {} frames",
                start + len,
                self.len()
            )));
        }
        Ok(match self {
            Frames::Dense { values, dim } => Frames::Dense {
                values: values[start * dim..(start + len) * dim].to_vec(),
                dim: *dim,
            },
            Frames::Sparse(ids) => Frames::Sparse(ids[start..start + len].to_vec()),
        })
    }

    /// Appends the frames of `other` in time.
    pub fn extend(&mut self, other: &Frames) -> Result<()> {
        match (self, other) {
            (Frames::Dense { values, dim }, Frames::Dense { values: more, dim: d2 })
                if *dim == *d2 =>
            {
                values.extend_from_slice(more);
                Ok(())
            }
            (Frames::Sparse(ids), Frames::Sparse(more)) => {
                ids.extend_from_slice(more);
                Ok(())
            }
            _ => Err(KairoError::data("cannot concatenate frames of different layouts")),
        }
    }
}

/// Per-epoch sequence ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqOrdering {
    /// Corpus order.
    #[default]
    Default,
    /// Reversed corpus order.
    Reverse,
    /// Ascending length, minimizing padding.
    Sorted,
    /// Descending length.
    SortedReverse,
    /// Shuffled with a generator seeded by the epoch.
    Random,
}

impl SeqOrdering {
    /// Parses the `seq_ordering` config value.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::Default),
            "reverse" => Ok(Self::Reverse),
            "sorted" => Ok(Self::Sorted),
            "sorted_reverse" => Ok(Self::SortedReverse),
            "random" => Ok(Self::Random),
            other => Err(KairoError::config(format!("unknown seq_ordering {other:?}"))),
        }
    }

    /// Reads `seq_ordering` from the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::parse(&config.value("seq_ordering", "default"))
    }

    /// Corpus indices in iteration order for the given epoch.
    pub fn order(
        self,
        epoch: usize,
        num_seqs: usize,
        seed: u64,
        seq_len: impl Fn(usize) -> usize,
    ) -> Vec<usize> {
        let mut order: Vec<usize> = (0..num_seqs).collect();
        match self {
            SeqOrdering::Default => {}
            SeqOrdering::Reverse => order.reverse(),
            // Stable sorts keep corpus order among equal lengths.
            SeqOrdering::Sorted => order.sort_by_key(|&i| seq_len(i)),
            SeqOrdering::SortedReverse => order.sort_by_key(|&i| std::cmp::Reverse(seq_len(i))),
            SeqOrdering::Random => {
                let mut rng = Rand64::new(((seed as u128) << 64) | epoch as u128);
                for i in (1..order.len()).rev() {
                    let j = rng.rand_range(0..(i as u64 + 1)) as usize;
                    order.swap(i, j);
                }
            }
        }
        order
    }
}

/// A source of variable-length sequences.
///
/// `seq_idx` arguments are positions in the order established by the last
/// [`Dataset::init_seq_order`] call.
pub trait Dataset: Send + Sync {
    /// Establishes the sequence order for an epoch. Returns whether the order
    /// changed.
    fn init_seq_order(&mut self, epoch: usize) -> Result<bool>;

    /// Number of sequences in the current epoch.
    fn num_seqs(&self) -> usize;

    /// Names of the provided streams.
    fn data_keys(&self) -> Vec<String>;

    /// Shape contract of a stream.
    fn data_spec(&self, key: &str) -> Option<DataSpec>;

    /// Number of frames of a sequence in a stream.
    fn seq_length(&self, seq_idx: usize, key: &str) -> Result<usize>;

    /// Identifier of a sequence.
    fn seq_tag(&self, seq_idx: usize) -> Result<String>;

    /// Frames of a sequence in a stream.
    fn frames(&self, seq_idx: usize, key: &str) -> Result<Frames>;

    /// Total number of input frames in the current epoch.
    fn num_timesteps(&self) -> Result<usize> {
        (0..self.num_seqs())
            .map(|i| self.seq_length(i, DEFAULT_INPUT_KEY))
            .sum()
    }
}

fn check_seq_idx(seq_idx: usize, num_seqs: usize) -> Result<()> {
    if seq_idx >= num_seqs {
        return Err(KairoError::data(format!(
            "sequence index {seq_idx} out of range ({num_seqs} sequences)"
        )));
    }
    Ok(())
}

/// Epoch order bookkeeping shared by the built-in datasets.
#[derive(Debug, Clone, Default)]
pub(crate) struct OrderState {
    pub(crate) ordering: SeqOrdering,
    pub(crate) seed: u64,
    pub(crate) epoch: Option<usize>,
    order: Vec<usize>,
}

impl OrderState {
    pub(crate) fn init(&mut self, epoch: usize, num_seqs: usize, seq_len: impl Fn(usize) -> usize) -> bool {
        if self.epoch == Some(epoch) && self.order.len() == num_seqs {
            return false;
        }
        let order = self.ordering.order(epoch, num_seqs, self.seed, seq_len);
        let changed = order != self.order;
        self.order = order;
        self.epoch = Some(epoch);
        changed
    }

    pub(crate) fn corpus_idx(&self, seq_idx: usize) -> Result<usize> {
        check_seq_idx(seq_idx, self.order.len())?;
        Ok(self.order[seq_idx])
    }
}

/// Synthetic dataset with deterministic content, used for smoke tests and
/// benchmarks.
///
/// Sequence `i` has features `((k % 10) - 5) / 10` for
/// `k in i .. i + seq_len * input_dim` and labels `k % output_dim` for the
/// following `seq_len` values of `k`.
#[derive(Debug, Clone)]
pub struct DummyDataset {
    input_dim: usize,
    output_dim: usize,
    num_seqs: usize,
    seq_len: usize,
    order: OrderState,
}

impl DummyDataset {
    /// Creates the dataset; the order defaults to corpus order for epoch 1.
    pub fn new(input_dim: usize, output_dim: usize, num_seqs: usize, seq_len: usize) -> Self {
        let mut order = OrderState::default();
        order.init(1, num_seqs, |_| seq_len);
        Self {
            input_dim,
            output_dim,
            num_seqs,
            seq_len,
            order,
        }
    }

    /// Sets the ordering policy used by subsequent `init_seq_order` calls.
    pub fn with_ordering(mut self, ordering: SeqOrdering, seed: u64) -> Self {
        self.order.ordering = ordering;
        self.order.seed = seed;
        self.order.epoch = None;
        let seq_len = self.seq_len;
        self.order.init(1, self.num_seqs, |_| seq_len);
        self
    }

    fn generate(&self, corpus_idx: usize, key: &str) -> Result<Frames> {
        let start = corpus_idx;
        let feature_count = self.seq_len * self.input_dim;
        match key {
            DEFAULT_INPUT_KEY => Ok(Frames::Dense {
                values: (start..start + feature_count)
                    .map(|k| ((k % 10) as f32 - 5.0) * 0.1)
                    .collect(),
                dim: self.input_dim,
            }),
            DEFAULT_TARGET_KEY => {
                let label_start = start + feature_count;
                Ok(Frames::Sparse(
                    (label_start..label_start + self.seq_len)
                        .map(|k| (k % self.output_dim) as u32)
                        .collect(),
                ))
            }
            other => Err(KairoError::data(format!("unknown data key {other:?}"))),
        }
    }
}

impl Dataset for DummyDataset {
    fn init_seq_order(&mut self, epoch: usize) -> Result<bool> {
        let seq_len = self.seq_len;
        Ok(self.order.init(epoch, self.num_seqs, |_| seq_len))
    }

    fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    fn data_keys(&self) -> Vec<String> {
        vec![DEFAULT_INPUT_KEY.to_string(), DEFAULT_TARGET_KEY.to_string()]
    }

    fn data_spec(&self, key: &str) -> Option<DataSpec> {
        match key {
            DEFAULT_INPUT_KEY => Some(DataSpec::dense(key, self.input_dim)),
            DEFAULT_TARGET_KEY => Some(DataSpec::sparse(key, self.output_dim)),
            _ => None,
        }
    }

    fn seq_length(&self, seq_idx: usize, key: &str) -> Result<usize> {
        check_seq_idx(seq_idx, self.num_seqs)?;
        if self.data_spec(key).is_none() {
            return Err(KairoError::data(format!("unknown data key {key:?}")));
        }
        Ok(self.seq_len)
    }

    fn seq_tag(&self, seq_idx: usize) -> Result<String> {
        Ok(format!("seq-{}", self.order.corpus_idx(seq_idx)?))
    }

    fn frames(&self, seq_idx: usize, key: &str) -> Result<Frames> {
        let corpus_idx = self.order.corpus_idx(seq_idx)?;
        self.generate(corpus_idx, key)
    }
}

/// One in-memory sequence.
#[derive(Debug, Clone)]
pub struct SeqRecord {
    /// Sequence tag.
    pub tag: String,
    /// Frames per stream.
    pub streams: BTreeMap<String, Frames>,
}

/// In-memory dataset over explicit sequences.
#[derive(Debug, Clone)]
pub struct StaticDataset {
    specs: BTreeMap<String, DataSpec>,
    seqs: Vec<SeqRecord>,
    order: OrderState,
}

impl StaticDataset {
    /// Creates the dataset, validating every record against the specs.
    pub fn new(specs: Vec<DataSpec>, seqs: Vec<SeqRecord>) -> Result<Self> {
        let specs: BTreeMap<String, DataSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        for seq in &seqs {
            for (key, spec) in &specs {
                let frames = seq.streams.get(key).ok_or_else(|| {
                    KairoError::data(format!("sequence {:?} lacks stream {key:?}", seq.tag))
                })?;
                let layout_ok = match frames {
                    Frames::Dense { values, dim } => {
                        !spec.sparse && *dim == spec.dim && *dim > 0 && values.len() % dim == 0
                    }
                    Frames::Sparse(ids) => {
                        spec.sparse && ids.iter().all(|&i| (i as usize) < spec.dim)
                    }
                };
                if !layout_ok {
                    return Err(KairoError::data(format!(
                        "sequence {:?}: stream {key:?} does not match its spec",
                        seq.tag
                    )));
                }
            }
        }
        let mut dataset = Self {
            specs,
            seqs,
            order: OrderState::default(),
        };
        dataset.init_seq_order(1)?;
        Ok(dataset)
    }

    /// Sets the ordering policy used by subsequent `init_seq_order` calls.
    pub fn with_ordering(mut self, ordering: SeqOrdering, seed: u64) -> Result<Self> {
        self.order.ordering = ordering;
        self.order.seed = seed;
        self.order.epoch = None;
        self.init_seq_order(1)?;
        Ok(self)
    }

    fn corpus_len(&self, corpus_idx: usize) -> usize {
        self.seqs[corpus_idx]
            .streams
            .values()
            .map(Frames::len)
            .max()
            .unwrap_or(0)
    }

    fn record(&self, seq_idx: usize) -> Result<&SeqRecord> {
        Ok(&self.seqs[self.order.corpus_idx(seq_idx)?])
    }
}

impl Dataset for StaticDataset {
    fn init_seq_order(&mut self, epoch: usize) -> Result<bool> {
        let lens: Vec<usize> = (0..self.seqs.len()).map(|i| self.corpus_len(i)).collect();
        Ok(self.order.init(epoch, self.seqs.len(), |i| lens[i]))
    }

    fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    fn data_keys(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    fn data_spec(&self, key: &str) -> Option<DataSpec> {
        self.specs.get(key).cloned()
    }

    fn seq_length(&self, seq_idx: usize, key: &str) -> Result<usize> {
        self.record(seq_idx)?
            .streams
            .get(key)
            .map(Frames::len)
            .ok_or_else(|| KairoError::data(format!("unknown data key {key:?}")))
    }

    fn seq_tag(&self, seq_idx: usize) -> Result<String> {
        Ok(self.record(seq_idx)?.tag.clone())
    }

    fn frames(&self, seq_idx: usize, key: &str) -> Result<Frames> {
        self.record(seq_idx)?
            .streams
            .get(key)
            .cloned()
            .ok_or_else(|| KairoError::data(format!("unknown data key {key:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_dataset_content() {
        let dataset = DummyDataset::new(2, 3, 2, 5);
        let Frames::Dense { values, dim } = dataset.frames(0, "data").unwrap() else {
            panic!("expected dense input");
        };
        assert_eq!(dim, 2);
        assert!((values[0] + 0.5).abs() < 1e-6);
        assert!((values[1] + 0.4).abs() < 1e-6);
        assert!((values[8] - 0.3).abs() < 1e-6);
        assert!((values[9] - 0.4).abs() < 1e-6);

        assert_eq!(
            dataset.frames(0, "classes").unwrap(),
            Frames::Sparse(vec![1, 2, 0, 1, 2])
        );
        assert_eq!(dataset.seq_tag(1).unwrap(), "seq-1");
        assert_eq!(dataset.num_timesteps().unwrap(), 10);
    }

    #[test]
    fn out_of_range_index_is_data_error() {
        let dataset = DummyDataset::new(2, 3, 2, 5);
        assert!(matches!(dataset.frames(2, "data"), Err(KairoError::Data(_))));
        assert!(matches!(dataset.frames(0, "speaker"), Err(KairoError::Data(_))));
    }

    #[test]
    fn sorted_ordering_is_stable() {
        let order = SeqOrdering::Sorted.order(1, 4, 0, |i| [3, 1, 3, 2][i]);
        assert_eq!(order, vec![1, 3, 0, 2]);
        let order = SeqOrdering::SortedReverse.order(1, 4, 0, |i| [3, 1, 3, 2][i]);
        assert_eq!(order, vec![0, 2, 3, 1]);
    }

    #[test]
    fn random_ordering_depends_on_epoch_only() {
        let a = SeqOrdering::Random.order(3, 20, 7, |_| 1);
        let b = SeqOrdering::Random.order(3, 20, 7, |_| 1);
        let c = SeqOrdering::Random.order(4, 20, 7, |_| 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn static_dataset_validates_and_orders() {
        let seq = |tag: &str, n: usize| SeqRecord {
            tag: tag.to_string(),
            streams: BTreeMap::from([
                (
                    "data".to_string(),
                    Frames::Dense {
                        values: vec![0.5; n],
                        dim: 1,
                    },
                ),
                ("classes".to_string(), Frames::Sparse(vec![1; n])),
            ]),
        };
        let specs = vec![DataSpec::dense("data", 1), DataSpec::sparse("classes", 2)];
        let dataset = StaticDataset::new(specs.clone(), vec![seq("a", 3), seq("b", 1)])
            .unwrap()
            .with_ordering(SeqOrdering::Sorted, 0)
            .unwrap();
        assert_eq!(dataset.seq_tag(0).unwrap(), "b");
        assert_eq!(dataset.seq_length(1, "classes").unwrap(), 3);

        let mut bad = seq("c", 2);
        bad.streams
            .insert("classes".to_string(), Frames::Sparse(vec![5, 0]));
        assert!(StaticDataset::new(specs, vec![bad]).is_err());
    }

    #[test]
    fn static_dataset_rejects_ragged_dense_frames() {
        let ragged = SeqRecord {
            tag: "r".to_string(),
            streams: BTreeMap::from([
                (
                    "data".to_string(),
                    Frames::Dense {
                        values: vec![0.0; 5],
                        dim: 2,
                    },
                ),
                ("classes".to_string(), Frames::Sparse(vec![0, 1])),
            ]),
        };
        let specs = vec![DataSpec::dense("data", 2), DataSpec::sparse("classes", 2)];
        assert!(matches!(
            StaticDataset::new(specs, vec![ragged]),
            Err(KairoError::Data(_))
        ));
    }

    #[test]
    fn frames_slice_and_extend() {
        let mut frames = Frames::Dense {
            values: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            dim: 2,
        };
        let tail = frames.slice(1, 2).unwrap();
        assert_eq!(
            tail,
            Frames::Dense {
                values: vec![2.0, 3.0, 4.0, 5.0],
                dim: 2
            }
        );
        frames.extend(&tail).unwrap();
        assert_eq!(frames.len(), 5);
        assert!(frames.slice(4, 2).is_err());
        assert!(frames.extend(&Frames::Sparse(vec![1])).is_err());
    }
}
