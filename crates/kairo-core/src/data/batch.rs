//! # Batch Assembler
//!
//! Groups sequences, or fixed-size windows of them, into batches under a
//! padded-frame budget. Batches are produced lazily in the dataset's current
//! sequence order.

use tracing::debug;

use crate::config::Config;
use crate::data::dataset::Dataset;
use crate::error::{KairoError, Result};

/// A contiguous frame range of one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpan {
    /// Position of the sequence in the current epoch order.
    pub seq_idx: usize,
    /// First frame.
    pub start: usize,
    /// Number of frames (longest stream for whole sequences).
    pub len: usize,
    /// Whether the span covers the whole sequence in every stream.
    pub whole: bool,
}

/// One row of a batch: one or more spans concatenated in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSlot {
    /// Spans in time order.
    pub spans: Vec<SeqSpan>,
}

impl BatchSlot {
    fn single(span: SeqSpan) -> Self {
        Self { spans: vec![span] }
    }

    /// Frames occupied by the slot.
    pub fn len(&self) -> usize {
        self.spans.iter().map(|s| s.len).sum()
    }

    /// Whether the slot holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A group of slots processed in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Rows of the batch.
    pub slots: Vec<BatchSlot>,
}

impl Batch {
    /// Number of rows.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of spans over all rows.
    pub fn num_spans(&self) -> usize {
        self.slots.iter().map(|s| s.spans.len()).sum()
    }

    /// Length of the longest row.
    pub fn max_len(&self) -> usize {
        self.slots.iter().map(BatchSlot::len).max().unwrap_or(0)
    }

    /// Frames after padding every row to the longest one.
    pub fn padded_frames(&self) -> usize {
        self.num_slots() * self.max_len()
    }

    /// Sequence indices in row order, one entry per span.
    pub fn seq_idxs(&self) -> Vec<usize> {
        self.slots
            .iter()
            .flat_map(|s| s.spans.iter().map(|span| span.seq_idx))
            .collect()
    }
}

/// Batching constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Maximum padded frames per batch.
    pub batch_size: usize,
    /// Maximum spans per batch.
    pub max_seqs: usize,
    /// Window `(size, step)` for chunking, if enabled.
    pub chunking: Option<(usize, usize)>,
    /// Whole sequences are merged into one row while the row stays within
    /// this many frames. Zero disables merging.
    pub merge_seqs_max_frames: usize,
    /// Restart from the first sequence instead of finishing.
    pub cyclic: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_seqs: usize::MAX,
            chunking: None,
            merge_seqs_max_frames: 0,
            cyclic: false,
        }
    }
}

impl BatchingConfig {
    /// Reads `batch_size`, `max_seqs`, `chunking`, `merge_seqs_max_frames`
    /// and `cyclic`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let defaults = Self::default();
        let chunking = match config.int_pair("chunking", (0, 0))? {
            (0, _) => None,
            (size, step) if size < 0 || step < 0 => {
                return Err(KairoError::config(format!(
                    "chunking must be non-negative, got {size}:{step}"
                )));
            }
            (size, step) => Some((size as usize, step as usize)),
        };
        let max_seqs = match config.usize("max_seqs", 0)? {
            0 if !config.has("max_seqs") => defaults.max_seqs,
            n => n,
        };
        let batching = Self {
            batch_size: config.usize("batch_size", defaults.batch_size)?,
            max_seqs,
            chunking,
            merge_seqs_max_frames: config.usize("merge_seqs_max_frames", 0)?,
            cyclic: config.bool("cyclic", false)?,
        };
        batching.validate()?;
        Ok(batching)
    }

    /// Checks the constraints for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(KairoError::config("batch_size must be positive"));
        }
        if self.max_seqs == 0 {
            return Err(KairoError::config("max_seqs must be positive"));
        }
        if let Some((size, step)) = self.chunking {
            if size == 0 || step == 0 {
                return Err(KairoError::config(format!(
                    "chunking size and step must be positive, got {size}:{step}"
                )));
            }
            if size > self.batch_size {
                return Err(KairoError::config(format!(
                    "chunk size {size} exceeds batch_size {}",
                    self.batch_size
                )));
            }
        }
        Ok(())
    }
}

/// Lazy, restartable producer of batches over a dataset's current order.
pub struct BatchSetGenerator<'a> {
    dataset: &'a dyn Dataset,
    config: BatchingConfig,
    keys: Vec<String>,
    seq_pos: usize,
    chunk_start: usize,
    lookahead: Option<SeqSpan>,
    pending: Option<BatchSlot>,
    failed: bool,
    batches_emitted: usize,
}

impl<'a> BatchSetGenerator<'a> {
    /// Creates a generator; fails when the constraints are inconsistent.
    pub fn new(dataset: &'a dyn Dataset, config: BatchingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dataset,
            config,
            keys: dataset.data_keys(),
            seq_pos: 0,
            chunk_start: 0,
            lookahead: None,
            pending: None,
            failed: false,
            batches_emitted: 0,
        })
    }

    /// Restarts from the first sequence of the dataset's current order.
    pub fn reset(&mut self) {
        self.seq_pos = 0;
        self.chunk_start = 0;
        self.lookahead = None;
        self.pending = None;
        self.failed = false;
        self.batches_emitted = 0;
    }

    /// The constraints in use.
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    fn stream_lengths(&self, seq_idx: usize) -> Result<Vec<usize>> {
        self.keys
            .iter()
            .map(|key| self.dataset.seq_length(seq_idx, key))
            .collect()
    }

    /// Next sequence or chunk in order, without merging.
    fn next_span(&mut self) -> Result<Option<SeqSpan>> {
        let mut wrapped = false;
        loop {
            if self.seq_pos >= self.dataset.num_seqs() {
                // Two wraps without a span means every sequence is empty.
                if !self.config.cyclic || self.dataset.num_seqs() == 0 || wrapped {
                    return Ok(None);
                }
                wrapped = true;
                self.seq_pos = 0;
                self.chunk_start = 0;
            }
            let seq_idx = self.seq_pos;
            let lengths = self.stream_lengths(seq_idx)?;
            let seq_len = lengths.iter().copied().max().unwrap_or(0);

            let Some((size, step)) = self.config.chunking else {
                self.seq_pos += 1;
                return Ok(Some(SeqSpan {
                    seq_idx,
                    start: 0,
                    len: seq_len,
                    whole: true,
                }));
            };

            if lengths.iter().any(|&l| l != seq_len) {
                return Err(KairoError::data(format!(
                    "cannot chunk sequence {:?}: stream lengths differ ({lengths:?})",
                    self.dataset.seq_tag(seq_idx)?
                )));
            }
            if self.chunk_start >= seq_len {
                self.seq_pos += 1;
                self.chunk_start = 0;
                continue;
            }
            let start = self.chunk_start;
            let len = size.min(seq_len - start);
            // A window reaching the end covers every later one.
            self.chunk_start = if start + len >= seq_len {
                seq_len
            } else {
                start + step
            };
            return Ok(Some(SeqSpan {
                seq_idx,
                start,
                len,
                whole: start == 0 && len == seq_len,
            }));
        }
    }

    fn peek_span(&mut self) -> Result<Option<SeqSpan>> {
        if self.lookahead.is_none() {
            self.lookahead = self.next_span()?;
        }
        Ok(self.lookahead)
    }

    /// Next batch row, merging short whole sequences when enabled.
    fn next_slot(&mut self) -> Result<Option<BatchSlot>> {
        if let Some(slot) = self.pending.take() {
            return Ok(Some(slot));
        }
        let Some(first) = self.peek_span()? else {
            return Ok(None);
        };
        self.lookahead = None;
        let merge_max = self.config.merge_seqs_max_frames;
        let mut slot = BatchSlot::single(first);
        if merge_max == 0 || !first.whole || first.len > merge_max {
            return Ok(Some(slot));
        }
        while let Some(next) = self.peek_span()? {
            if !next.whole || slot.len() + next.len > merge_max {
                break;
            }
            // A cyclic wrap must not put a sequence twice into one row.
            if slot.spans.iter().any(|s| s.seq_idx == next.seq_idx) {
                break;
            }
            slot.spans.push(next);
            self.lookahead = None;
        }
        Ok(Some(slot))
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut batch = Batch::default();
        let mut max_len = 0usize;
        let mut spans = 0usize;
        while let Some(slot) = self.next_slot()? {
            let len = slot.len();
            let rows = batch.num_slots() + 1;
            let exceeds_frames = rows * max_len.max(len) > self.config.batch_size;
            let exceeds_seqs = spans + slot.spans.len() > self.config.max_seqs;
            // A cyclic pass may come back to a span already in this batch.
            let repeats = self.config.cyclic
                && batch.slots.iter().any(|s| {
                    s.spans
                        .iter()
                        .any(|a| slot.spans.iter().any(|b| a.seq_idx == b.seq_idx && a.start == b.start))
                });
            if !batch.slots.is_empty() && (exceeds_frames || exceeds_seqs || repeats) {
                self.pending = Some(slot);
                break;
            }
            max_len = max_len.max(len);
            spans += slot.spans.len();
            batch.slots.push(slot);
            // An oversized row stays alone.
            if batch.num_slots() == 1 && len > self.config.batch_size {
                break;
            }
        }
        if batch.slots.is_empty() {
            return Ok(None);
        }
        debug!(
            batch = self.batches_emitted,
            slots = batch.num_slots(),
            max_len = batch.max_len(),
            "assembled batch"
        );
        self.batches_emitted += 1;
        Ok(Some(batch))
    }
}

impl Iterator for BatchSetGenerator<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_batch() {
            Ok(batch) => batch.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::data::dataset::{DummyDataset, Frames, SeqRecord, StaticDataset};
    use crate::data::extern_data::DataSpec;

    fn dataset_with_lengths(lengths: &[usize]) -> StaticDataset {
        let seqs = lengths
            .iter()
            .enumerate()
            .map(|(i, &n)| SeqRecord {
                tag: format!("s{i}"),
                streams: BTreeMap::from([(
                    "data".to_string(),
                    Frames::Dense {
                        values: vec![i as f32; n],
                        dim: 1,
                    },
                )]),
            })
            .collect();
        StaticDataset::new(vec![DataSpec::dense("data", 1)], seqs).unwrap()
    }

    fn collect(dataset: &dyn Dataset, config: BatchingConfig) -> Vec<Batch> {
        BatchSetGenerator::new(dataset, config)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn every_sequence_once_and_within_budget() {
        let dataset = dataset_with_lengths(&[3, 5, 2, 7, 1, 4]);
        let config = BatchingConfig {
            batch_size: 10,
            ..Default::default()
        };
        let batches = collect(&dataset, config);

        let seen: Vec<usize> = batches.iter().flat_map(Batch::seq_idxs).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        for batch in &batches {
            assert!(batch.padded_frames() <= 10);
        }
        assert_eq!(batches[0].seq_idxs(), vec![0, 1]);
    }

    #[test]
    fn oversized_sequence_gets_its_own_batch() {
        let dataset = dataset_with_lengths(&[2, 12, 2]);
        let config = BatchingConfig {
            batch_size: 5,
            ..Default::default()
        };
        let batches = collect(&dataset, config);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].seq_idxs(), vec![1]);
        assert_eq!(batches[1].max_len(), 12);
    }

    #[test]
    fn max_seqs_limits_rows() {
        let dataset = DummyDataset::new(2, 3, 5, 1);
        let config = BatchingConfig {
            batch_size: 100,
            max_seqs: 2,
            ..Default::default()
        };
        let sizes: Vec<usize> = collect(&dataset, config)
            .iter()
            .map(Batch::num_slots)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn chunking_windows() {
        let dataset = dataset_with_lengths(&[5]);
        let config = BatchingConfig {
            batch_size: 3,
            chunking: Some((3, 2)),
            ..Default::default()
        };
        let spans: Vec<(usize, usize)> = collect(&dataset, config)
            .iter()
            .flat_map(|b| b.slots.iter().flat_map(|s| s.spans.iter()))
            .map(|s| (s.start, s.len))
            .collect();
        assert_eq!(spans, vec![(0, 3), (2, 3)]);
    }

    #[test]
    fn chunking_stops_at_the_window_reaching_the_end() {
        let dataset = dataset_with_lengths(&[7, 4]);
        let config = BatchingConfig {
            batch_size: 10,
            chunking: Some((4, 2)),
            ..Default::default()
        };
        let spans: Vec<(usize, usize, usize)> = collect(&dataset, config)
            .iter()
            .flat_map(|b| b.slots.iter().flat_map(|s| s.spans.iter()))
            .map(|s| (s.seq_idx, s.start, s.len))
            .collect();
        assert_eq!(spans, vec![(0, 0, 4), (0, 2, 4), (0, 4, 3), (1, 0, 4)]);
    }

    #[test]
    fn chunking_unequal_streams_is_data_error() {
        let dataset = DummyDataset::new(2, 3, 1, 4);
        let mut ok = collect(
            &dataset,
            BatchingConfig {
                batch_size: 4,
                chunking: Some((2, 2)),
                ..Default::default()
            },
        );
        assert_eq!(ok.pop().map(|b| b.max_len()), Some(2));

        let seq = SeqRecord {
            tag: "uneven".into(),
            streams: BTreeMap::from([
                (
                    "data".to_string(),
                    Frames::Dense {
                        values: vec![0.0; 4],
                        dim: 1,
                    },
                ),
                ("classes".to_string(), Frames::Sparse(vec![0, 1])),
            ]),
        };
        let dataset = StaticDataset::new(
            vec![DataSpec::dense("data", 1), DataSpec::sparse("classes", 2)],
            vec![seq],
        )
        .unwrap();
        let mut generator = BatchSetGenerator::new(
            &dataset,
            BatchingConfig {
                batch_size: 4,
                chunking: Some((2, 2)),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(generator.next(), Some(Err(KairoError::Data(_)))));
        assert!(generator.next().is_none());
    }

    #[test]
    fn invalid_constraints_are_config_errors() {
        let dataset = dataset_with_lengths(&[1]);
        for config in [
            BatchingConfig {
                batch_size: 0,
                ..Default::default()
            },
            BatchingConfig {
                max_seqs: 0,
                ..Default::default()
            },
            BatchingConfig {
                batch_size: 4,
                chunking: Some((5, 1)),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                BatchSetGenerator::new(&dataset, config),
                Err(KairoError::Config(_))
            ));
        }
    }

    #[test]
    fn merging_short_sequences() {
        let dataset = dataset_with_lengths(&[2, 3, 4, 1]);
        let config = BatchingConfig {
            batch_size: 100,
            merge_seqs_max_frames: 5,
            ..Default::default()
        };
        let batches = collect(&dataset, config);
        let rows: Vec<Vec<usize>> = batches[0]
            .slots
            .iter()
            .map(|s| s.spans.iter().map(|span| span.seq_idx).collect())
            .collect();
        assert_eq!(rows, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn reset_and_cyclic() {
        let dataset = dataset_with_lengths(&[2, 2, 2]);
        let config = BatchingConfig {
            batch_size: 4,
            ..Default::default()
        };
        let mut generator = BatchSetGenerator::new(&dataset, config.clone()).unwrap();
        assert_eq!(generator.by_ref().count(), 2);
        generator.reset();
        assert_eq!(generator.count(), 2);

        let cyclic = BatchSetGenerator::new(
            &dataset,
            BatchingConfig {
                cyclic: true,
                ..config
            },
        )
        .unwrap();
        let seen: Vec<usize> = cyclic
            .take(3)
            .flat_map(|b| b.unwrap().seq_idxs())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn from_config_reads_keys() {
        let mut config = Config::new();
        config.set("batch_size", 50);
        config.set("chunking", "10:5");
        config.set("max_seqs", 4);
        let batching = BatchingConfig::from_config(&config).unwrap();
        assert_eq!(batching.batch_size, 50);
        assert_eq!(batching.chunking, Some((10, 5)));
        assert_eq!(batching.max_seqs, 4);
        assert!(!batching.cyclic);

        config.set("max_seqs", 0);
        assert!(BatchingConfig::from_config(&config).is_err());
    }
}
