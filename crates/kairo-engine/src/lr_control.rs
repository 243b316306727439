//! # Learning-Rate Control
//!
//! Keeps per-epoch learning rates and scores and decides the rate of the
//! next epoch from the validation history. The history is persisted as JSON
//! next to the checkpoints so a resumed run makes the same decisions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use kairo_core::data::write_atomic;
use kairo_core::{Config, KairoError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Score recorded for the training data of an epoch.
pub const TRAIN_SCORE: &str = "train_score";
/// Score recorded for the held-out data of an epoch.
pub const DEV_SCORE: &str = "dev_score";
/// Error rate recorded for the held-out data of an epoch.
pub const DEV_ERROR: &str = "dev_error";

/// Learning rate and scores of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochData {
    pub learning_rate: f64,
    #[serde(default)]
    pub errors: BTreeMap<String, f64>,
}

/// How the rate of the next epoch is derived.
#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    /// Every epoch uses the initial rate.
    Constant,
    /// Multiply by `decay` once the relative improvement of the error
    /// measure stayed above `threshold` for `patience` epochs.
    Newbob {
        threshold: f64,
        decay: f64,
        patience: usize,
    },
}

impl LrPolicy {
    fn from_config(config: &Config) -> Result<Self> {
        match config.value("learning_rate_control", "constant").as_str() {
            "constant" => Ok(Self::Constant),
            "newbob" | "newbob_rel" | "newbob_relative" => {
                let decay = config.float("newbob_learning_rate_decay", 0.5)?;
                if !(decay > 0.0 && decay <= 1.0) {
                    return Err(KairoError::config(format!(
                        "newbob_learning_rate_decay must be in (0, 1], got {decay}"
                    )));
                }
                Ok(Self::Newbob {
                    threshold: config.float("newbob_relative_error_threshold", -0.01)?,
                    decay,
                    patience: config.usize("newbob_patience", 1)?.max(1),
                })
            }
            other => Err(KairoError::config(format!(
                "unknown learning_rate_control {other:?}"
            ))),
        }
    }
}

/// Per-epoch learning-rate bookkeeping.
#[derive(Debug, Clone)]
pub struct LearningRateControl {
    policy: LrPolicy,
    initial: f64,
    min: f64,
    error_measure: Option<String>,
    epochs: BTreeMap<usize, EpochData>,
}

impl LearningRateControl {
    pub fn new(policy: LrPolicy, initial: f64) -> Self {
        Self {
            policy,
            initial,
            min: 0.0,
            error_measure: None,
            epochs: BTreeMap::new(),
        }
    }

    /// Reads `learning_rate`, `learning_rate_control`, the `newbob_*` keys,
    /// `min_learning_rate` and `learning_rate_control_error_measure`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let initial = config.float("learning_rate", 1.0)?;
        if !(initial.is_finite() && initial > 0.0) {
            return Err(KairoError::config(format!(
                "learning_rate must be positive, got {initial}"
            )));
        }
        let mut control = Self::new(LrPolicy::from_config(config)?, initial);
        control.min = config.float("min_learning_rate", 0.0)?;
        control.error_measure = config.value_opt("learning_rate_control_error_measure");
        Ok(control)
    }

    pub fn policy(&self) -> &LrPolicy {
        &self.policy
    }

    /// Everything recorded so far, keyed by epoch.
    pub fn epoch_data(&self) -> &BTreeMap<usize, EpochData> {
        &self.epochs
    }

    /// Rate of `epoch`, deciding and recording it on first request.
    pub fn lr_for_epoch(&mut self, epoch: usize) -> f64 {
        if let Some(data) = self.epochs.get(&epoch) {
            return data.learning_rate;
        }
        let lr = self.decide(epoch);
        self.epochs.insert(
            epoch,
            EpochData {
                learning_rate: lr,
                errors: BTreeMap::new(),
            },
        );
        lr
    }

    /// Merges scores into the record of `epoch`.
    pub fn set_epoch_error(&mut self, epoch: usize, errors: BTreeMap<String, f64>) {
        let lr = self.lr_for_epoch(epoch);
        let entry = self.epochs.entry(epoch).or_insert(EpochData {
            learning_rate: lr,
            errors: BTreeMap::new(),
        });
        entry.errors.extend(errors);
    }

    /// The score the policy looks at: the configured measure, else
    /// `dev_score`, else `train_score`.
    pub fn error_measure_value(&self, epoch: usize) -> Option<f64> {
        let errors = &self.epochs.get(&epoch)?.errors;
        match &self.error_measure {
            Some(key) => errors.get(key).copied(),
            None => errors
                .get(DEV_SCORE)
                .or_else(|| errors.get(TRAIN_SCORE))
                .copied(),
        }
    }

    fn decide(&self, epoch: usize) -> f64 {
        let Some((&last_epoch, last)) = self.epochs.range(..epoch).next_back() else {
            return self.initial;
        };
        let LrPolicy::Newbob {
            threshold,
            decay,
            patience,
        } = self.policy
        else {
            return last.learning_rate;
        };
        // Only epochs run at the current rate count towards the patience.
        let mut stalled = 0;
        let mut e = last_epoch;
        while stalled < patience {
            let Some(prev) = e.checked_sub(1) else { break };
            let rate_of = |epoch: usize| self.epochs.get(&epoch).map(|d| d.learning_rate);
            let same_rate = rate_of(e) == Some(last.learning_rate)
                && rate_of(prev) == Some(last.learning_rate);
            let (Some(cur_err), Some(prev_err)) =
                (self.error_measure_value(e), self.error_measure_value(prev))
            else {
                break;
            };
            if !same_rate || prev_err == 0.0 {
                break;
            }
            if (cur_err - prev_err) / prev_err.abs() <= threshold {
                break;
            }
            stalled += 1;
            e = prev;
        }
        if stalled >= patience {
            let lr = (last.learning_rate * decay).max(self.min);
            info!(epoch, from = last.learning_rate, to = lr, "newbob: decaying learning rate");
            lr
        } else {
            last.learning_rate
        }
    }

    /// Writes the history atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.epochs)?;
        write_atomic(path, &json)
    }

    /// Replaces the history with the one stored at `path`.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path).map_err(|e| KairoError::io(path, e))?;
        self.epochs = serde_json::from_slice(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newbob(patience: usize) -> LearningRateControl {
        LearningRateControl::new(
            LrPolicy::Newbob {
                threshold: -0.01,
                decay: 0.5,
                patience,
            },
            1.0,
        )
    }

    fn dev(score: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([(DEV_SCORE.to_string(), score)])
    }

    #[test]
    fn constant_keeps_initial_rate() {
        let mut control = LearningRateControl::new(LrPolicy::Constant, 0.1);
        for epoch in 1..=4 {
            assert_eq!(control.lr_for_epoch(epoch), 0.1);
            control.set_epoch_error(epoch, dev(1.0));
        }
    }

    #[test]
    fn newbob_decays_when_improvement_stalls() {
        let mut control = newbob(1);
        assert_eq!(control.lr_for_epoch(1), 1.0);
        control.set_epoch_error(1, dev(2.0));
        assert_eq!(control.lr_for_epoch(2), 1.0);
        control.set_epoch_error(2, dev(1.0));
        // 50% better: no decay.
        assert_eq!(control.lr_for_epoch(3), 1.0);
        control.set_epoch_error(3, dev(0.999));
        // Only 0.1% better.
        assert_eq!(control.lr_for_epoch(4), 0.5);
        control.set_epoch_error(4, dev(0.998));
        // Epoch 3 ran at the old rate, so 4 against 3 does not count.
        assert_eq!(control.lr_for_epoch(5), 0.5);
    }

    #[test]
    fn newbob_respects_patience_and_floor() {
        let mut control = newbob(2);
        control.min = 0.4;
        for (epoch, score) in [(1, 1.0), (2, 1.0), (3, 1.0)] {
            control.lr_for_epoch(epoch);
            control.set_epoch_error(epoch, dev(score));
        }
        assert_eq!(control.epoch_data()[&3].learning_rate, 1.0);
        assert_eq!(control.lr_for_epoch(4), 0.5);
        control.set_epoch_error(4, dev(1.0));
        for epoch in [5, 6] {
            assert_eq!(control.lr_for_epoch(epoch), 0.5);
            control.set_epoch_error(epoch, dev(1.0));
        }
        assert_eq!(control.lr_for_epoch(7), 0.4);
    }

    #[test]
    fn error_measure_falls_back_to_train_score() {
        let mut control = newbob(1);
        control.set_epoch_error(1, BTreeMap::from([(TRAIN_SCORE.to_string(), 3.0)]));
        assert_eq!(control.error_measure_value(1), Some(3.0));
        control.set_epoch_error(1, dev(2.0));
        assert_eq!(control.error_measure_value(1), Some(2.0));
    }

    #[test]
    fn history_survives_save_and_load() {
        let dir = std::env::temp_dir().join(format!("kairo-lr-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.lr_control.json");

        let mut control = newbob(1);
        control.lr_for_epoch(1);
        control.set_epoch_error(1, dev(0.7));
        control.save(&path).unwrap();

        let mut restored = newbob(1);
        restored.load(&path).unwrap();
        assert_eq!(restored.epoch_data(), control.epoch_data());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_unknown_policy() {
        let mut config = Config::new();
        config.set("learning_rate_control", "cosine");
        assert!(matches!(
            LearningRateControl::from_config(&config),
            Err(KairoError::Config(_))
        ));
    }
}
