//! # Inference and Search
//!
//! Gradient-free passes over a dataset with a built [`Engine`]: forwarding
//! one sequence, dumping the outputs of a whole dataset into the persisted
//! dataset format, beam search through the network's `choice` layers, and
//! per-layer scoring.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Tensor};
use kairo_core::data::{
    Batch, BatchSlot, BatchingConfig, Dataset, DatasetFileWriter, FeedBuilder, SeqSpan,
};
use kairo_core::network::{DEFAULT_OUTPUT_LAYER, Data, RunMode};
use kairo_core::{KairoError, Result};
use tracing::info;

use crate::engine::{Engine, ScoreSums, batch_seed, for_each_feed, provided_streams};

/// Layer read by [`Engine::search`] when `search_output_layer` is not set.
pub const DEFAULT_SEARCH_LAYER: &str = "decision";

/// Best hypothesis for one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHypothesis {
    pub tag: String,
    pub labels: Vec<u32>,
    /// Cumulative log-probability, when the output came out of a beam.
    pub score: Option<f64>,
}

/// Per-layer averages of a scoring pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeStats {
    pub num_seqs: usize,
    pub num_batches: usize,
    /// Frames each layer was scored on.
    pub frames: BTreeMap<String, usize>,
    /// Loss per frame.
    pub scores: BTreeMap<String, f64>,
    /// Error per frame.
    pub errors: BTreeMap<String, f64>,
}

impl From<&ScoreSums> for AnalyzeStats {
    fn from(sums: &ScoreSums) -> Self {
        Self {
            num_seqs: sums.num_seqs,
            num_batches: sums.num_batches,
            frames: sums.frames(),
            scores: sums.scores(),
            errors: sums.errors(),
        }
    }
}

/// Label rows of a sparse output, each cut to its length.
fn label_rows(out: &Data) -> Result<Vec<Vec<u32>>> {
    if !out.spec.sparse {
        return Err(KairoError::data(format!(
            "layer {:?} is dense; search needs label output",
            out.spec.name
        )));
    }
    let values = out.values.to_dtype(DType::U32)?;
    if !out.spec.time_axis {
        return Ok(values.to_vec1::<u32>()?.into_iter().map(|l| vec![l]).collect());
    }
    let mut rows = values.to_vec2::<u32>()?;
    if let Some(lengths) = &out.lengths {
        for (row, &len) in rows.iter_mut().zip(lengths) {
            row.truncate(len);
        }
    }
    Ok(rows)
}

/// Flattened frames of every row of a time-axis output, each cut to its
/// length. `tags` names the rows the output must cover.
fn frame_rows(out: &Data, tags: &[String]) -> Result<Vec<Vec<f32>>> {
    let lengths = out.lengths.as_deref().ok_or_else(|| {
        KairoError::data(format!("layer {:?} has a time axis but no lengths", out.spec.name))
    })?;
    if lengths.len() != tags.len() || out.batch_size()? != tags.len() {
        return Err(KairoError::data(format!(
            "layer {:?} has {} rows for {} sequences",
            out.spec.name,
            lengths.len(),
            tags.len()
        )));
    }
    let values = out.values.to_dtype(DType::F32)?;
    lengths
        .iter()
        .enumerate()
        .map(|(row, &len)| {
            let frames = values.get(row)?.narrow(0, 0, len)?.flatten_all()?;
            Ok(frames.to_vec1::<f32>()?)
        })
        .collect()
}

impl Engine {
    fn forward_layer(&self) -> String {
        self.config
            .value("forward_output_layer", DEFAULT_OUTPUT_LAYER)
    }

    /// The epoch whose sequence order inference passes use.
    fn inference_epoch(&self) -> usize {
        self.epoch.max(1)
    }

    /// Output of the forward layer for one sequence of the dataset's current
    /// order: `(time, dim)` for dense outputs, `(time,)` for labels, with
    /// the batch axis removed and padding cut off.
    pub fn forward_single(&self, dataset: &dyn Dataset, seq_idx: usize) -> Result<Tensor> {
        let network = self.network()?;
        let extern_data = provided_streams(network.extern_data(), dataset)?;
        let mut len = 0;
        for key in extern_data.keys() {
            len = len.max(dataset.seq_length(seq_idx, &key)?);
        }
        let batch = Batch {
            slots: vec![BatchSlot {
                spans: vec![SeqSpan {
                    seq_idx,
                    start: 0,
                    len,
                    whole: true,
                }],
            }],
        };
        let feed = FeedBuilder::new(dataset, &extern_data, self.device.clone())?.build(&batch)?;
        let outputs = network.forward(
            &feed,
            RunMode::Eval,
            batch_seed(self.seed, self.inference_epoch(), 0),
        )?;
        let out = outputs.output(&self.forward_layer())?;
        let values = out.values.squeeze(0)?;
        Ok(match &out.lengths {
            Some(lengths) => values.narrow(0, 0, lengths[0])?,
            None => values,
        })
    }

    /// Forwards every sequence and writes the forward layer's outputs in the
    /// persisted dataset format. Returns the number of sequences written.
    pub fn forward_to_file(
        &mut self,
        dataset: &mut dyn Dataset,
        path: &Path,
        batch_size: usize,
    ) -> Result<usize> {
        let epoch = self.inference_epoch();
        dataset.init_seq_order(epoch)?;
        let dataset: &dyn Dataset = dataset;
        let network = self.network()?;
        let layer = self.forward_layer();
        let spec = network.output_spec(&layer)?.clone();
        if !spec.time_axis {
            return Err(KairoError::config(format!(
                "layer {layer:?} has no time axis and cannot be written per frame"
            )));
        }
        let dim = if spec.sparse { 1 } else { spec.dim };
        let mut writer = DatasetFileWriter::new(dim, dim);
        let extern_data = provided_streams(network.extern_data(), dataset)?;
        let batching = BatchingConfig {
            batch_size,
            max_seqs: self.batching.max_seqs,
            ..BatchingConfig::default()
        };
        let seed = self.seed;

        for_each_feed(
            dataset,
            &extern_data,
            &self.device,
            &batching,
            self.queue_size,
            |batch, feed| {
                let outputs = network.forward(&feed, RunMode::Eval, batch_seed(seed, epoch, batch))?;
                let rows = frame_rows(outputs.output(&layer)?, &feed.seq_tags)?;
                for (tag, frames) in feed.seq_tags.iter().zip(&rows) {
                    writer.add_seq(tag, frames, None)?;
                }
                Ok(())
            },
        )?;
        writer.write(path)?;
        info!(path = %path.display(), seqs = writer.num_seqs(), layer = %layer, "forwarded dataset");
        Ok(writer.num_seqs())
    }

    /// Beam search over the dataset. Returns the best hypothesis of every
    /// sequence, read from `search_output_layer` (default `decision`), and
    /// records the errors of the run.
    pub fn search(&mut self, dataset: &mut dyn Dataset) -> Result<Vec<SearchHypothesis>> {
        let epoch = self.inference_epoch();
        dataset.init_seq_order(epoch)?;
        let dataset: &dyn Dataset = dataset;
        let network = self.network()?;
        let layer = self.config.value("search_output_layer", DEFAULT_SEARCH_LAYER);
        let extern_data = provided_streams(network.extern_data(), dataset)?;
        let batching = BatchingConfig {
            chunking: None,
            merge_seqs_max_frames: 0,
            ..self.batching.clone()
        };
        let seed = self.seed;
        let mut sums = ScoreSums::default();
        let mut hypotheses = Vec::new();

        for_each_feed(
            dataset,
            &extern_data,
            &self.device,
            &batching,
            self.queue_size,
            |batch, feed| {
                let outputs =
                    network.forward(&feed, RunMode::Search, batch_seed(seed, epoch, batch))?;
                sums.add(&outputs.sums()?, feed.seq_tags.len());
                let out = outputs.output(&layer)?;
                let rows = out.batch_size()?;
                if rows != feed.seq_tags.len() {
                    return Err(KairoError::data(format!(
                        "layer {layer:?} has {rows} rows for {} sequences; is it a decide layer?",
                        feed.seq_tags.len()
                    )));
                }
                for (row, labels) in label_rows(out)?.into_iter().enumerate() {
                    hypotheses.push(SearchHypothesis {
                        tag: feed.seq_tags[row].clone(),
                        labels,
                        score: out.beam.as_ref().map(|b| b.scores[row] as f64),
                    });
                }
                Ok(())
            },
        )?;
        info!(
            seqs = hypotheses.len(),
            errors = ?sums.errors(),
            "search done"
        );
        self.error_by_layer = sums.errors();
        self.total_objective = sums.total_score();
        Ok(hypotheses)
    }

    /// Scores the dataset without updates and reports per-layer averages.
    pub fn analyze(&mut self, dataset: &mut dyn Dataset) -> Result<AnalyzeStats> {
        let sums = self.score_dataset(dataset, self.inference_epoch(), RunMode::Eval)?;
        let stats = AnalyzeStats::from(&sums);
        info!(
            seqs = stats.num_seqs,
            scores = ?stats.scores,
            errors = ?stats.errors,
            "analyzed dataset"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use kairo_core::data::DataSpec;

    use super::*;

    #[test]
    fn label_rows_are_cut_to_length() {
        let values = Tensor::new(&[[1u32, 2, 0], [3, 0, 0]], &Device::Cpu).unwrap();
        let out = Data::new(DataSpec::sparse("decision", 4), values, Some(vec![3, 1])).unwrap();
        assert_eq!(label_rows(&out).unwrap(), vec![vec![1, 2, 0], vec![3]]);
    }

    #[test]
    fn frame_rows_cover_every_sequence() {
        let values = Tensor::new(
            &[[[1f32, 2.0], [3.0, 4.0]], [[5.0, 6.0], [0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let out = Data::new(DataSpec::dense("output", 2), values, Some(vec![2, 1])).unwrap();
        let tags = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            frame_rows(&out, &tags).unwrap(),
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0]]
        );

        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(matches!(frame_rows(&out, &three), Err(KairoError::Data(_))));

        let unsized_out = Data {
            lengths: None,
            sizes: None,
            ..out
        };
        assert!(matches!(frame_rows(&unsized_out, &tags), Err(KairoError::Data(_))));
    }

    #[test]
    fn dense_output_is_not_a_label_sequence() {
        let values = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = Data::new(DataSpec::dense("output", 3), values, Some(vec![2])).unwrap();
        assert!(matches!(label_rows(&out), Err(KairoError::Data(_))));
    }
}
