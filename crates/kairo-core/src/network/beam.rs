//! # Beam Search State
//!
//! Host-side bookkeeping of the hypotheses expanded by a recurrent unit.
//! Rows are laid out batch-major: row `b * width + h` is hypothesis `h` of
//! original batch row `b`.

use std::cmp::Ordering;

use crate::error::{KairoError, Result};
use crate::network::value::BeamInfo;

/// Hypotheses of one search run.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamState {
    batch: usize,
    width: usize,
    /// Cumulative log-probability per row.
    pub scores: Vec<f32>,
    /// Whether the row has emitted its end frame.
    pub finished: Vec<bool>,
    /// Frames per row, end frame included.
    pub lengths: Vec<usize>,
    /// Original batch row of each row.
    pub batch_rows: Vec<u32>,
    reorder: Option<Vec<u32>>,
}

impl BeamState {
    /// One hypothesis per batch row with score zero.
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            width: 1,
            scores: vec![0.0; batch],
            finished: vec![false; batch],
            lengths: vec![0; batch],
            batch_rows: (0..batch as u32).collect(),
            reorder: None,
        }
    }

    /// Original batch size.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Hypotheses per batch row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Total number of rows.
    pub fn rows(&self) -> usize {
        self.batch * self.width
    }

    /// Expands every row by its label log-probabilities (`rows x
    /// num_classes`, row-major) and keeps the best `beam_size` continuations
    /// per batch row. Finished rows contribute one continuation, label 0,
    /// with unchanged score. Equal scores are ordered by (source hypothesis,
    /// label) ascending.
    ///
    /// Returns the chosen labels; the source row of each new row is kept for
    /// [`BeamState::take_reorder`].
    pub fn expand(
        &mut self,
        log_probs: &[f32],
        num_classes: usize,
        beam_size: usize,
    ) -> Result<Vec<u32>> {
        let rows = self.rows();
        if num_classes == 0 || beam_size == 0 || log_probs.len() != rows * num_classes {
            return Err(KairoError::config(format!(
                "beam expansion: {} scores for {rows} rows x {num_classes} classes, beam {beam_size}",
                log_probs.len()
            )));
        }
        let new_width = beam_size.min(self.width * num_classes);
        let mut labels = Vec::with_capacity(self.batch * new_width);
        let mut src_rows = Vec::with_capacity(self.batch * new_width);
        let mut scores = Vec::with_capacity(self.batch * new_width);

        for b in 0..self.batch {
            let mut candidates: Vec<(f32, usize)> = Vec::with_capacity(self.width * num_classes);
            for h in 0..self.width {
                let row = b * self.width + h;
                for c in 0..num_classes {
                    let score = if self.finished[row] {
                        if c == 0 { self.scores[row] } else { f32::NEG_INFINITY }
                    } else {
                        let lp = log_probs[row * num_classes + c];
                        if lp.is_nan() { f32::NEG_INFINITY } else { self.scores[row] + lp }
                    };
                    candidates.push((score, h * num_classes + c));
                }
            }
            candidates.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            for &(score, flat) in candidates.iter().take(new_width) {
                let (h, c) = (flat / num_classes, flat % num_classes);
                labels.push(c as u32);
                src_rows.push((b * self.width + h) as u32);
                scores.push(score);
            }
        }

        self.finished = src_rows
            .iter()
            .zip(&scores)
            .map(|(&src, &score)| self.finished[src as usize] || score == f32::NEG_INFINITY)
            .collect();
        self.lengths = src_rows.iter().map(|&src| self.lengths[src as usize]).collect();
        self.batch_rows = src_rows.iter().map(|&src| self.batch_rows[src as usize]).collect();
        self.scores = scores;
        self.width = new_width;
        self.reorder = Some(src_rows);
        Ok(labels)
    }

    /// Source row of every row since the last expansion, if any.
    pub fn take_reorder(&mut self) -> Option<Vec<u32>> {
        self.reorder.take()
    }

    /// Freezes rows that emitted their end frame at `step`; their length is
    /// `step + 1`.
    pub fn mark_ended(&mut self, ended: &[bool], step: usize) -> Result<()> {
        if ended.len() != self.rows() {
            return Err(KairoError::config(format!(
                "end flags for {} rows, beam has {}",
                ended.len(),
                self.rows()
            )));
        }
        for (row, &end) in ended.iter().enumerate() {
            if end && !self.finished[row] {
                self.finished[row] = true;
                self.lengths[row] = step + 1;
            }
        }
        Ok(())
    }

    /// Sets the length of rows still running after `steps` steps.
    pub fn finalize(&mut self, steps: usize) {
        for (row, finished) in self.finished.iter().enumerate() {
            if !finished {
                self.lengths[row] = steps;
            }
        }
    }

    /// Whether every row has ended.
    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|&f| f)
    }

    /// Snapshot for attaching to values.
    pub fn info(&self) -> BeamInfo {
        BeamInfo {
            width: self.width,
            scores: self.scores.clone(),
            batch_rows: self.batch_rows.clone(),
        }
    }
}

/// Row of the best hypothesis per batch row; the lowest row wins ties.
pub fn best_rows(info: &BeamInfo) -> Vec<u32> {
    let width = info.width.max(1);
    info.scores
        .chunks(width)
        .enumerate()
        .map(|(b, scores)| {
            let mut best = 0;
            for (h, &s) in scores.iter().enumerate() {
                if s > scores[best] {
                    best = h;
                }
            }
            (b * width + best) as u32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ln(p: f32) -> f32 {
        p.ln()
    }

    #[test]
    fn first_expansion_keeps_top_labels() {
        let mut beam = BeamState::new(1);
        let labels = beam
            .expand(&[ln(0.1), ln(0.6), ln(0.3)], 3, 2)
            .unwrap();
        assert_eq!(labels, vec![1, 2]);
        assert_eq!(beam.width(), 2);
        assert_eq!(beam.take_reorder(), Some(vec![0, 0]));
        assert!(beam.take_reorder().is_none());
    }

    #[test]
    fn ties_resolve_to_lowest_hypothesis_then_label() {
        let mut beam = BeamState::new(1);
        beam.expand(&[ln(0.5), ln(0.5)], 2, 2).unwrap();
        assert_eq!(beam.scores[0], beam.scores[1]);

        let labels = beam.expand(&[ln(0.5); 4], 2, 3).unwrap();
        assert_eq!(labels, vec![0, 1, 0]);
        assert_eq!(beam.take_reorder(), Some(vec![0, 0, 1]));
    }

    #[test]
    fn finished_rows_keep_one_continuation() {
        let mut beam = BeamState::new(1);
        beam.expand(&[ln(0.7), ln(0.3)], 2, 2).unwrap();
        beam.mark_ended(&[true, false], 0).unwrap();
        let frozen_score = beam.scores[0];

        let labels = beam.expand(&[ln(0.5), ln(0.5), ln(0.9), ln(0.1)], 2, 2).unwrap();
        assert_eq!(beam.take_reorder(), Some(vec![0, 1]));
        assert_eq!(labels, vec![0, 0]);
        assert_eq!(beam.scores[0], frozen_score);
        assert!(beam.finished[0]);
        assert_eq!(beam.lengths[0], 1);
        assert!(!beam.finished[1]);

        beam.finalize(4);
        assert_eq!(beam.lengths, vec![1, 4]);
    }

    #[test]
    fn batch_rows_follow_hypotheses() {
        let mut beam = BeamState::new(2);
        beam.expand(&[ln(0.9), ln(0.1), ln(0.2), ln(0.8)], 2, 2)
            .unwrap();
        assert_eq!(beam.batch_rows, vec![0, 0, 1, 1]);
        assert_eq!(beam.rows(), 4);

        let best = best_rows(&beam.info());
        assert_eq!(best, vec![0, 2]);
        assert!(beam.expand(&[0.0; 3], 2, 2).is_err());
    }

    #[test]
    fn best_rows_prefers_lowest_index_on_tie() {
        let info = BeamInfo {
            width: 3,
            scores: vec![-1.0, -0.5, -0.5],
            batch_rows: vec![0, 0, 0],
        };
        assert_eq!(best_rows(&info), vec![1]);
    }
}
