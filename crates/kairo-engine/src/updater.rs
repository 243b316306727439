//! # Updater
//!
//! Applies one optimizer step per training batch. Plain SGD uses candle's
//! optimizer; Adam and Nadam keep their moment estimates as named tensors so
//! they can be stored in a checkpoint and restored on resume.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use kairo_core::network::ParamStore;
use kairo_core::{Config, KairoError, Result};

/// Hyperparameters of [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Nesterov momentum (Nadam).
    pub nesterov: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            nesterov: false,
        }
    }
}

/// Adam with bias-corrected moments, optionally with Nesterov momentum.
pub struct Adam {
    vars: Vec<Var>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    step: usize,
    config: AdamConfig,
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> candle_core::Result<Self> {
        let m = vars
            .iter()
            .map(|v| v.as_tensor().zeros_like())
            .collect::<candle_core::Result<Vec<_>>>()?;
        let v = m.clone();
        Ok(Self {
            vars,
            m,
            v,
            step: 0,
            config,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            epsilon,
            nesterov,
        } = self.config;
        let t = self.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        for (i, var) in self.vars.iter().enumerate() {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let m = (self.m[i].affine(beta1, 0.0)? + g.affine(1.0 - beta1, 0.0)?)?;
            let v = (self.v[i].affine(beta2, 0.0)? + g.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let numerator = if nesterov {
                (m_hat.affine(beta1, 0.0)? + g.affine((1.0 - beta1) / bias1, 0.0)?)?
            } else {
                m_hat
            };
            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, epsilon)?;
            let update = numerator.div(&denom)?.affine(lr, 0.0)?;
            var.set(&var.as_tensor().sub(&update)?)?;
            self.m[i] = m;
            self.v[i] = v;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Slot tensor names: `optimizer:<slot>:<param>`.
fn slot_name(slot: &str, param: &str) -> String {
    format!("optimizer:{slot}:{param}")
}

enum Kind {
    Sgd(SGD),
    Adam(Adam),
}

/// Gradients of one loss, with their squared global norm.
pub struct Gradients {
    store: GradStore,
    squared_norm: f64,
}

impl Gradients {
    /// Sum of the squared entries of every parameter gradient.
    pub fn squared_norm(&self) -> f64 {
        self.squared_norm
    }

    pub fn is_finite(&self) -> bool {
        self.squared_norm.is_finite()
    }
}

/// The configured optimizer over every parameter of a store.
pub struct Updater {
    kind: Kind,
    vars: Vec<Var>,
    names: Vec<String>,
    step: usize,
}

impl Updater {
    /// Picks the optimizer from `optimizer` (`sgd`, `adam`, `nadam`) or the
    /// boolean `adam`/`nadam` keys; SGD when nothing is set.
    pub fn from_config(config: &Config, params: &ParamStore, lr: f64) -> Result<Self> {
        let name = match config.value_opt("optimizer") {
            Some(name) => name.to_lowercase(),
            None if config.bool("nadam", false)? => "nadam".to_string(),
            None if config.bool("adam", false)? => "adam".to_string(),
            None => "sgd".to_string(),
        };
        let vars = params.vars();
        let kind = match name.as_str() {
            "sgd" => Kind::Sgd(SGD::new(vars.clone(), lr)?),
            "adam" | "nadam" => Kind::Adam(Adam::new(
                vars.clone(),
                AdamConfig {
                    lr,
                    beta1: config.float("adam_beta1", 0.9)?,
                    beta2: config.float("adam_beta2", 0.999)?,
                    epsilon: config.float("optimizer_epsilon", 1e-8)?,
                    nesterov: name == "nadam",
                },
            )?),
            other => {
                return Err(KairoError::config(format!("unknown optimizer {other:?}")));
            }
        };
        Ok(Self {
            kind,
            vars,
            names: params.names(),
            step: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            Kind::Sgd(_) => "sgd",
            Kind::Adam(adam) if adam.config.nesterov => "nadam",
            Kind::Adam(_) => "adam",
        }
    }

    /// Updates applied so far.
    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.kind {
            Kind::Sgd(sgd) => sgd.learning_rate(),
            Kind::Adam(adam) => adam.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.kind {
            Kind::Sgd(sgd) => sgd.set_learning_rate(lr),
            Kind::Adam(adam) => adam.set_learning_rate(lr),
        }
    }

    /// Backpropagates `loss` without touching the parameters.
    pub fn gradients(&self, loss: &Tensor) -> Result<Gradients> {
        let store = loss.backward()?;
        let mut squared_norm = 0.0;
        for var in &self.vars {
            if let Some(g) = store.get(var.as_tensor()) {
                squared_norm += g
                    .to_dtype(DType::F64)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f64>()?;
            }
        }
        Ok(Gradients {
            store,
            squared_norm,
        })
    }

    /// Applies one update. Non-finite gradients are refused with a numerical
    /// error without batch context and leave the parameters untouched.
    pub fn apply(&mut self, grads: &Gradients) -> Result<()> {
        if !grads.is_finite() {
            return Err(KairoError::Numerical {
                epoch: 0,
                batch: 0,
                layers: Vec::new(),
                seq_tags: Vec::new(),
                value: grads.squared_norm,
            });
        }
        match &mut self.kind {
            Kind::Sgd(sgd) => sgd.step(&grads.store)?,
            Kind::Adam(adam) => adam.step(&grads.store)?,
        }
        self.step += 1;
        Ok(())
    }

    /// Backpropagates `loss` and applies one update.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = self.gradients(loss)?;
        self.apply(&grads)
    }

    /// Optimizer state for a checkpoint.
    pub fn slots(&self) -> BTreeMap<String, Tensor> {
        let mut slots = BTreeMap::new();
        if let Kind::Adam(adam) = &self.kind {
            for (i, name) in self.names.iter().enumerate() {
                slots.insert(slot_name("m", name), adam.m[i].clone());
                slots.insert(slot_name("v", name), adam.v[i].clone());
            }
        }
        slots
    }

    /// Restores the state written by [`Updater::slots`]. Missing slots are a
    /// configuration error for Adam; SGD has none.
    pub fn restore(&mut self, slots: &BTreeMap<String, Tensor>, global_step: usize) -> Result<()> {
        if let Kind::Adam(adam) = &mut self.kind {
            for (i, name) in self.names.iter().enumerate() {
                for (slot, store) in [("m", &mut adam.m), ("v", &mut adam.v)] {
                    let key = slot_name(slot, name);
                    let tensor = slots.get(&key).ok_or_else(|| {
                        KairoError::config(format!("checkpoint lacks optimizer slot {key:?}"))
                    })?;
                    if tensor.dims() != store[i].dims() {
                        return Err(KairoError::config(format!(
                            "optimizer slot {key:?} has shape {:?}, expected {:?}",
                            tensor.dims(),
                            store[i].dims()
                        )));
                    }
                    store[i] = tensor.clone();
                }
            }
            adam.step = global_step;
        }
        self.step = global_step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use kairo_core::network::Init;

    use super::*;

    fn quadratic_store() -> ParamStore {
        let mut params = ParamStore::new(0, Device::Cpu);
        params.get_or_init("w", &[2], Init::Const(1.0)).unwrap();
        params
    }

    fn loss_of(params: &ParamStore) -> Tensor {
        params.get("w").unwrap().as_tensor().sqr().unwrap().sum_all().unwrap()
    }

    fn value(params: &ParamStore) -> Vec<f32> {
        params.get("w").unwrap().as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn sgd_is_the_default() {
        let params = quadratic_store();
        let mut updater = Updater::from_config(&Config::new(), &params, 0.25).unwrap();
        assert_eq!(updater.name(), "sgd");
        updater.backward_step(&loss_of(&params)).unwrap();
        // w - lr * 2w
        assert_eq!(value(&params), vec![0.5, 0.5]);
        assert_eq!(updater.global_step(), 1);
        assert!(updater.slots().is_empty());
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let params = quadratic_store();
        let mut config = Config::new();
        config.set("adam", "true");
        let mut updater = Updater::from_config(&config, &params, 0.1).unwrap();
        assert_eq!(updater.name(), "adam");
        updater.backward_step(&loss_of(&params)).unwrap();
        for w in value(&params) {
            assert!((w - 0.9).abs() < 1e-5);
        }
        assert_eq!(updater.slots().len(), 2);
    }

    #[test]
    fn infinite_gradient_is_refused() {
        for optimizer in ["sgd", "adam"] {
            let params = quadratic_store();
            let mut config = Config::new();
            config.set("optimizer", optimizer);
            let mut updater = Updater::from_config(&config, &params, 0.1).unwrap();
            // sqrt(w - 1) is 0 at w = 1 while its derivative is infinite.
            let loss = params
                .get("w")
                .unwrap()
                .as_tensor()
                .affine(1.0, -1.0)
                .unwrap()
                .sqrt()
                .unwrap()
                .sum_all()
                .unwrap();
            assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);

            let grads = updater.gradients(&loss).unwrap();
            assert!(!grads.is_finite());
            assert!(matches!(
                updater.apply(&grads),
                Err(KairoError::Numerical { .. })
            ));
            assert!(matches!(
                updater.backward_step(&loss),
                Err(KairoError::Numerical { .. })
            ));
            assert_eq!(value(&params), vec![1.0, 1.0], "{optimizer}");
            assert_eq!(updater.global_step(), 0);
        }
    }

    #[test]
    fn gradient_norm_sums_every_parameter() {
        let params = quadratic_store();
        let updater = Updater::from_config(&Config::new(), &params, 0.1).unwrap();
        // d/dw sum(w^2) = 2w = [2, 2]
        let grads = updater.gradients(&loss_of(&params)).unwrap();
        assert!((grads.squared_norm() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn nadam_state_restores() {
        let params = quadratic_store();
        let mut config = Config::new();
        config.set("optimizer", "Nadam");
        let mut updater = Updater::from_config(&config, &params, 0.01).unwrap();
        assert_eq!(updater.name(), "nadam");
        updater.backward_step(&loss_of(&params)).unwrap();
        let slots = updater.slots();

        let fresh = quadratic_store();
        let mut restored = Updater::from_config(&config, &fresh, 0.01).unwrap();
        restored.restore(&slots, updater.global_step()).unwrap();
        assert_eq!(restored.global_step(), 1);
        let m = restored.slots()[&slot_name("m", "w")].to_vec1::<f32>().unwrap();
        assert!((m[0] - 0.2).abs() < 1e-6);

        assert!(matches!(
            restored.restore(&BTreeMap::new(), 1),
            Err(KairoError::Config(_))
        ));
    }
}
