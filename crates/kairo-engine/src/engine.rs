//! # Training Engine
//!
//! Owns the device, the parameters and the built network of one run and
//! drives epochs over a training dataset: batches are fed from a background
//! provider, every batch gets one optimizer step, the held-out dataset is
//! scored after each epoch and the learning-rate control picks the rate of
//! the next one. Checkpoints make an interrupted run resumable.
//!
//! ```text
//! Uninitialized -> NetworkBuilt -> Training(e) -> Evaluating(e) -> Checkpointing(e)
//!                                       ^                                 |
//!                                       +------------ Training(e+1) <-----+
//!                                                          ...  -> Finished
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::thread;

use candle_core::Device;
use kairo_core::data::{
    BatchSetGenerator, BatchingConfig, DataProvider, Dataset, ExternData, FeedBuilder, FeedDict,
};
use kairo_core::network::{LossSums, Network, ParamStore, RunMode, RunOutputs};
use kairo_core::{Config, KairoError, Result};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, checkpoint_path, find_latest, lr_control_path};
use crate::lr_control::{DEV_ERROR, DEV_SCORE, LearningRateControl, TRAIN_SCORE};
use crate::updater::Updater;

/// Epochs trained when `num_epochs` is not set.
pub const DEFAULT_NUM_EPOCHS: usize = 5;

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    NetworkBuilt,
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Checkpointing { epoch: usize },
    Finished,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::NetworkBuilt => write!(f, "network built"),
            Self::Training { epoch } => write!(f, "training epoch {epoch}"),
            Self::Evaluating { epoch } => write!(f, "evaluating epoch {epoch}"),
            Self::Checkpointing { epoch } => write!(f, "checkpointing epoch {epoch}"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct LayerSums {
    loss: Option<f64>,
    error: Option<f64>,
    frames: usize,
}

/// Loss and error sums of a dataset pass, weighted by frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSums {
    layers: BTreeMap<String, LayerSums>,
    /// Sequences seen.
    pub num_seqs: usize,
    /// Batches seen.
    pub num_batches: usize,
}

impl ScoreSums {
    /// Adds the sums of one batch of `num_seqs` sequences.
    pub fn add(&mut self, sums: &[LossSums], num_seqs: usize) {
        for s in sums {
            let entry = self.layers.entry(s.name.clone()).or_default();
            if let Some(loss) = s.loss {
                *entry.loss.get_or_insert(0.0) += loss;
            }
            if let Some(error) = s.error {
                *entry.error.get_or_insert(0.0) += error;
            }
            entry.frames += s.frames;
        }
        self.num_seqs += num_seqs;
        self.num_batches += 1;
    }

    /// Loss per frame for every layer with a loss.
    pub fn scores(&self) -> BTreeMap<String, f64> {
        self.layers
            .iter()
            .filter_map(|(name, s)| s.loss.map(|l| (name.clone(), l / s.frames.max(1) as f64)))
            .collect()
    }

    /// Error per frame for every layer with an error.
    pub fn errors(&self) -> BTreeMap<String, f64> {
        self.layers
            .iter()
            .filter_map(|(name, s)| s.error.map(|e| (name.clone(), e / s.frames.max(1) as f64)))
            .collect()
    }

    /// Frames each layer's sums run over.
    pub fn frames(&self) -> BTreeMap<String, usize> {
        self.layers
            .iter()
            .map(|(name, s)| (name.clone(), s.frames))
            .collect()
    }

    /// Summed per-frame losses: the objective without weight decay.
    pub fn total_score(&self) -> Option<f64> {
        let scores = self.scores();
        (!scores.is_empty()).then(|| scores.values().sum())
    }

    /// Summed per-frame errors.
    pub fn total_error(&self) -> Option<f64> {
        let errors = self.errors();
        (!errors.is_empty()).then(|| errors.values().sum())
    }

    /// `<prefix>_score`, `<prefix>_error` and, with several loss layers,
    /// the per-layer values under `<prefix>_score_<layer>` / `<prefix>_error_<layer>`.
    fn report(&self, prefix: &str) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if let Some(score) = self.total_score() {
            out.insert(format!("{prefix}_score"), score);
        }
        if let Some(error) = self.total_error() {
            out.insert(format!("{prefix}_error"), error);
        }
        if self.layers.len() > 1 {
            for (name, score) in self.scores() {
                out.insert(format!("{prefix}_score_{name}"), score);
            }
            for (name, error) in self.errors() {
                out.insert(format!("{prefix}_error_{name}"), error);
            }
        }
        out
    }
}

/// Dropout seed of one batch.
pub(crate) fn batch_seed(seed: u64, epoch: usize, batch: usize) -> u64 {
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ ((epoch as u64) << 32) ^ batch as u64
}

/// The declared streams the dataset provides.
pub(crate) fn provided_streams(extern_data: &ExternData, dataset: &dyn Dataset) -> Result<ExternData> {
    let keys = dataset.data_keys();
    let mut provided = ExternData::new();
    for key in extern_data.keys() {
        if keys.contains(&key) {
            provided.register(extern_data.get(&key)?.clone());
        }
    }
    Ok(provided)
}

/// Feeds every batch of the dataset's current order to `f` from a
/// background provider. Returns the number of batches.
pub(crate) fn for_each_feed<F>(
    dataset: &dyn Dataset,
    extern_data: &ExternData,
    device: &Device,
    batching: &BatchingConfig,
    queue_size: usize,
    mut f: F,
) -> Result<usize>
where
    F: FnMut(usize, FeedDict) -> Result<()>,
{
    let builder = FeedBuilder::new(dataset, extern_data, device.clone())?;
    let batches = BatchSetGenerator::new(dataset, batching.clone())?;
    thread::scope(|scope| {
        let provider = DataProvider::start(scope, builder, batches, queue_size);
        let mut count = 0;
        for feed in provider {
            f(count, feed?)?;
            count += 1;
        }
        Ok(count)
    })
}

fn numerical_error(
    epoch: usize,
    batch: usize,
    feed: &FeedDict,
    outputs: &RunOutputs,
    value: f64,
) -> Result<KairoError> {
    let sums = outputs.sums()?;
    let mut layers: Vec<String> = sums
        .iter()
        .filter(|s| s.loss.is_some_and(|l| !l.is_finite()))
        .map(|s| s.name.clone())
        .collect();
    if layers.is_empty() {
        layers = sums.into_iter().map(|s| s.name).collect();
    }
    Ok(KairoError::Numerical {
        epoch,
        batch,
        layers,
        seq_tags: feed.seq_tags.clone(),
        value,
    })
}

/// Training and inference over one network.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) device: Device,
    pub(crate) seed: u64,
    state: EngineState,
    pub(crate) params: ParamStore,
    pub(crate) network: Option<Network>,
    updater: Option<Updater>,
    lr_control: LearningRateControl,
    pub(crate) epoch: usize,
    pub(crate) batching: BatchingConfig,
    pub(crate) queue_size: usize,
    pub(crate) error_by_layer: BTreeMap<String, f64>,
    pub(crate) total_objective: Option<f64>,
}

impl Engine {
    /// Reads the run-wide settings; the network is built by one of the
    /// `init_*` methods.
    pub fn new(config: Config) -> Result<Self> {
        let seed = config.int("random_seed", 42)? as u64;
        let device = Device::Cpu;
        let mut batching = BatchingConfig::from_config(&config)?;
        batching.cyclic = false;
        let queue_size = config.usize("data_queue_size", 4)?;
        let lr_control = LearningRateControl::from_config(&config)?;
        Ok(Self {
            params: ParamStore::new(seed, device.clone()),
            config,
            device,
            seed,
            state: EngineState::Uninitialized,
            network: None,
            updater: None,
            lr_control,
            epoch: 0,
            batching,
            queue_size,
            error_by_layer: BTreeMap::new(),
            total_objective: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// The built network; an invalid-state error before initialization.
    pub fn network(&self) -> Result<&Network> {
        self.network
            .as_ref()
            .ok_or_else(|| KairoError::State("network not built yet".to_string()))
    }

    /// Per-epoch learning rates and scores.
    pub fn learning_rate_control(&self) -> &LearningRateControl {
        &self.lr_control
    }

    /// Last completed (or loaded) epoch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Optimizer updates applied so far.
    pub fn global_step(&self) -> usize {
        self.updater.as_ref().map_or(0, Updater::global_step)
    }

    /// Per-frame errors of the last dataset pass.
    pub fn error_by_layer(&self) -> &BTreeMap<String, f64> {
        &self.error_by_layer
    }

    /// Objective of the last dataset pass.
    pub fn total_objective(&self) -> Option<f64> {
        self.total_objective
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "engine state");
        self.state = next;
    }

    fn model_prefix(&self) -> Option<String> {
        self.config.value_opt("model")
    }

    fn num_epochs(&self) -> Result<usize> {
        self.config.usize("num_epochs", DEFAULT_NUM_EPOCHS)
    }

    fn build_network(&mut self, dataset: Option<&dyn Dataset>) -> Result<()> {
        let mut extern_data = ExternData::new();
        extern_data.init_from_config(&self.config)?;
        if extern_data.keys().is_empty() {
            let dataset = dataset.ok_or_else(|| {
                KairoError::config(
                    "no extern data: set num_inputs/num_outputs or extern_data, or pass a dataset",
                )
            })?;
            extern_data.init_from_dataset(dataset)?;
        }
        self.params = ParamStore::new(self.seed, self.device.clone());
        let network = Network::from_config(&self.config, &extern_data, &mut self.params)?;
        info!(
            layers = network.layer_names().len(),
            params = self.params.len(),
            weights = self.params.num_weights(),
            "network built"
        );
        self.network = Some(network);
        self.epoch = 0;
        self.transition(EngineState::NetworkBuilt);
        Ok(())
    }

    /// Builds the network for forwarding or search and loads the newest
    /// checkpoint, or the one of `load_epoch` when set.
    pub fn init_network_from_config(&mut self, dataset: Option<&dyn Dataset>) -> Result<()> {
        self.build_network(dataset)?;
        let Some(model) = self.model_prefix() else {
            return Ok(());
        };
        let found = if self.config.has("load_epoch") {
            let epoch = self.config.usize("load_epoch", 0)?;
            let path = checkpoint_path(&model, epoch);
            Some((epoch, path))
        } else {
            find_latest(&model, self.num_epochs()?)?
        };
        if let Some((_, path)) = found {
            let checkpoint = Checkpoint::load(&path, &self.device)?;
            self.params.load(&checkpoint.params)?;
            self.epoch = checkpoint.epoch;
            info!(path = %path.display(), epoch = self.epoch, "loaded model");
        }
        Ok(())
    }

    /// Builds the network and the optimizer for training and resumes from
    /// the newest checkpoint of `model` no later than `num_epochs`.
    pub fn init_train_from_config(
        &mut self,
        train_data: &dyn Dataset,
        dev_data: Option<&dyn Dataset>,
    ) -> Result<()> {
        self.build_network(Some(train_data))?;
        let network = self.network()?;
        network.extern_data().check_dataset(train_data)?;
        if let Some(dev) = dev_data {
            network.extern_data().check_dataset(dev)?;
        }
        let initial_lr = self.config.float("learning_rate", 1.0)?;
        let mut updater = Updater::from_config(&self.config, &self.params, initial_lr)?;
        self.lr_control = LearningRateControl::from_config(&self.config)?;

        if let Some(model) = self.model_prefix() {
            let lr_path = lr_control_path(&model);
            if lr_path.exists() {
                self.lr_control.load(&lr_path)?;
            }
            if let Some((_, path)) = find_latest(&model, self.num_epochs()?)? {
                let checkpoint = Checkpoint::load(&path, &self.device)?;
                self.params.load(&checkpoint.params)?;
                if checkpoint.optimizer == updater.name() {
                    updater.restore(&checkpoint.slots, checkpoint.global_step)?;
                } else {
                    warn!(
                        saved = %checkpoint.optimizer,
                        configured = updater.name(),
                        "optimizer changed; starting with fresh optimizer state"
                    );
                }
                self.epoch = checkpoint.epoch;
                info!(
                    path = %path.display(),
                    epoch = self.epoch,
                    global_step = checkpoint.global_step,
                    "resuming training"
                );
            }
        }
        info!(optimizer = updater.name(), "training initialized");
        self.updater = Some(updater);
        Ok(())
    }

    /// Trains from the epoch after the last completed one up to
    /// `num_epochs`.
    pub fn train(
        &mut self,
        train_data: &mut dyn Dataset,
        mut dev_data: Option<&mut dyn Dataset>,
    ) -> Result<()> {
        if self.updater.is_none() {
            return Err(KairoError::State(
                "init_train_from_config must run before train".to_string(),
            ));
        }
        let num_epochs = self.num_epochs()?;
        let save_interval = self.config.usize("save_interval", 1)?.max(1);
        if self.epoch >= num_epochs {
            info!(epoch = self.epoch, num_epochs, "nothing left to train");
        }
        for epoch in self.epoch + 1..=num_epochs {
            self.transition(EngineState::Training { epoch });
            let lr = self.lr_control.lr_for_epoch(epoch);
            let train_sums = self.train_epoch(train_data, epoch, lr)?;
            let mut errors = BTreeMap::new();
            if let Some(score) = train_sums.total_score() {
                errors.insert(TRAIN_SCORE.to_string(), score);
            }

            if let Some(dev) = dev_data.as_deref_mut() {
                self.transition(EngineState::Evaluating { epoch });
                let dev_sums = self.score_dataset(dev, epoch, RunMode::Eval)?;
                errors.extend(dev_sums.report("dev"));
            }
            info!(
                epoch,
                learning_rate = lr,
                train_score = errors.get(TRAIN_SCORE).copied(),
                dev_score = errors.get(DEV_SCORE).copied(),
                dev_error = errors.get(DEV_ERROR).copied(),
                "epoch finished"
            );
            self.lr_control.set_epoch_error(epoch, errors);
            self.epoch = epoch;

            if epoch % save_interval == 0 || epoch == num_epochs {
                self.transition(EngineState::Checkpointing { epoch });
                self.save_checkpoint(epoch)?;
            } else {
                self.save_lr_control()?;
            }
        }
        self.transition(EngineState::Finished);
        Ok(())
    }

    fn train_epoch(&mut self, dataset: &mut dyn Dataset, epoch: usize, lr: f64) -> Result<ScoreSums> {
        dataset.init_seq_order(epoch)?;
        let dataset: &dyn Dataset = dataset;
        let network = self
            .network
            .as_ref()
            .ok_or_else(|| KairoError::State("network not built yet".to_string()))?;
        let updater = self
            .updater
            .as_mut()
            .ok_or_else(|| KairoError::State("no optimizer".to_string()))?;
        updater.set_learning_rate(lr);
        let seed = self.seed;
        let mut sums = ScoreSums::default();
        let mut objective = 0.0;

        let batches = for_each_feed(
            dataset,
            network.extern_data(),
            &self.device,
            &self.batching,
            self.queue_size,
            |batch, feed| {
                let outputs = network.forward(&feed, RunMode::Train, batch_seed(seed, epoch, batch))?;
                let loss = outputs.loss()?;
                let value = loss.to_scalar::<f32>()? as f64;
                if !value.is_finite() {
                    return Err(numerical_error(epoch, batch, &feed, &outputs, value)?);
                }
                sums.add(&outputs.sums()?, feed.seq_tags.len());
                objective += value;
                if outputs.has_loss() {
                    let grads = updater.gradients(&loss)?;
                    if !grads.is_finite() {
                        return Err(numerical_error(
                            epoch,
                            batch,
                            &feed,
                            &outputs,
                            grads.squared_norm(),
                        )?);
                    }
                    updater.apply(&grads)?;
                }
                Ok(())
            },
        )?;
        info!(
            epoch,
            batches,
            seqs = sums.num_seqs,
            score = sums.total_score(),
            "train epoch done"
        );
        self.error_by_layer = sums.errors();
        self.total_objective = (batches > 0).then(|| objective / batches as f64);
        Ok(sums)
    }

    /// Runs the network over the whole dataset in `epoch`'s order without
    /// updates and accumulates its losses and errors.
    pub(crate) fn score_dataset(
        &mut self,
        dataset: &mut dyn Dataset,
        epoch: usize,
        mode: RunMode,
    ) -> Result<ScoreSums> {
        dataset.init_seq_order(epoch)?;
        let dataset: &dyn Dataset = dataset;
        let network = self.network()?;
        let extern_data = provided_streams(network.extern_data(), dataset)?;
        let seed = self.seed;
        let mut sums = ScoreSums::default();
        for_each_feed(
            dataset,
            &extern_data,
            &self.device,
            &self.batching,
            self.queue_size,
            |batch, feed| {
                let outputs = network.forward(&feed, mode, batch_seed(seed, epoch, batch))?;
                sums.add(&outputs.sums()?, feed.seq_tags.len());
                Ok(())
            },
        )?;
        self.error_by_layer = sums.errors();
        self.total_objective = sums.total_score();
        Ok(sums)
    }

    fn save_lr_control(&self) -> Result<()> {
        if let Some(model) = self.model_prefix() {
            self.lr_control.save(&lr_control_path(&model))?;
        }
        Ok(())
    }

    fn save_checkpoint(&mut self, epoch: usize) -> Result<()> {
        let Some(model) = self.model_prefix() else {
            debug!(epoch, "no model path set; not saving");
            return Ok(());
        };
        let updater = self
            .updater
            .as_ref()
            .ok_or_else(|| KairoError::State("no optimizer".to_string()))?;
        let checkpoint = Checkpoint {
            epoch,
            global_step: updater.global_step(),
            learning_rate: updater.learning_rate(),
            optimizer: updater.name().to_string(),
            params: self.params.tensors(),
            slots: updater.slots(),
        };
        checkpoint.save(&checkpoint_path(&model, epoch))?;
        self.save_lr_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(name: &str, loss: f64, error: f64, frames: usize) -> LossSums {
        LossSums {
            name: name.to_string(),
            loss: Some(loss),
            error: Some(error),
            frames,
        }
    }

    #[test]
    fn scores_are_frame_weighted() {
        let mut total = ScoreSums::default();
        total.add(&[sums("output", 4.0, 1.0, 2)], 1);
        total.add(&[sums("output", 2.0, 2.0, 6)], 3);
        assert_eq!(total.scores()["output"], 0.75);
        assert_eq!(total.errors()["output"], 0.375);
        assert_eq!(total.num_seqs, 4);
        assert_eq!(total.num_batches, 2);
        let report = total.report("dev");
        assert_eq!(report.len(), 2);
        assert_eq!(report[DEV_SCORE], 0.75);
    }

    #[test]
    fn several_layers_are_reported_separately() {
        let mut total = ScoreSums::default();
        total.add(
            &[
                sums("output", 1.0, 0.0, 1),
                LossSums {
                    name: "decision".to_string(),
                    loss: None,
                    error: Some(3.0),
                    frames: 6,
                },
            ],
            2,
        );
        let report = total.report("dev");
        assert_eq!(report["dev_score"], 1.0);
        assert_eq!(report["dev_error"], 0.5);
        assert_eq!(report["dev_error_decision"], 0.5);
        assert!(!report.contains_key("dev_score_decision"));
    }

    #[test]
    fn batch_seeds_differ() {
        assert_ne!(batch_seed(1, 1, 0), batch_seed(1, 1, 1));
        assert_ne!(batch_seed(1, 1, 0), batch_seed(1, 2, 0));
        assert_eq!(batch_seed(7, 3, 2), batch_seed(7, 3, 2));
    }

    #[test]
    fn training_needs_initialization() {
        let mut engine = Engine::new(Config::new()).unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        let mut data = kairo_core::data::DummyDataset::new(2, 2, 1, 3);
        assert!(matches!(
            engine.train(&mut data, None),
            Err(KairoError::State(_))
        ));
        assert!(engine.network().is_err());
    }
}
