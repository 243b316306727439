//! # Parameter Store
//!
//! Named trainable variables. Initial values come from a generator seeded by
//! the global seed and the parameter name, so they do not depend on build
//! order or on the tensor backend's own random source.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use oorandom::Rand32;

use crate::error::{KairoError, Result};

/// How a parameter is initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    Glorot { fan_in: usize, fan_out: usize },
    /// Every element set to the constant.
    Const(f32),
}

/// FNV-1a over the name; mixes the name into the seed.
fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// All trainable variables of a network.
#[derive(Debug, Clone)]
pub struct ParamStore {
    vars: BTreeMap<String, Var>,
    seed: u64,
    device: Device,
}

impl ParamStore {
    /// Creates an empty store.
    pub fn new(seed: u64, device: Device) -> Self {
        Self {
            vars: BTreeMap::new(),
            seed,
            device,
        }
    }

    /// Device new parameters are placed on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the parameter, creating it on first use. A second request
    /// with another shape is a configuration error.
    pub fn get_or_init(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Var> {
        if let Some(var) = self.vars.get(name) {
            if var.dims() != shape {
                return Err(KairoError::config(format!(
                    "parameter {name:?} requested with shape {shape:?}, exists with {:?}",
                    var.dims()
                )));
            }
            return Ok(var.clone());
        }
        let count: usize = shape.iter().product();
        let values: Vec<f32> = match init {
            Init::Const(v) => vec![v; count],
            Init::Glorot { fan_in, fan_out } => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                let mut rng = Rand32::new(self.seed ^ name_hash(name));
                (0..count)
                    .map(|_| (rng.rand_float() * 2.0 - 1.0) * limit)
                    .collect()
            }
        };
        let tensor = Tensor::from_vec(values, shape, &self.device)?;
        let var = Var::from_tensor(&tensor)?;
        self.vars.insert(name.to_string(), var.clone());
        Ok(var)
    }

    /// Looks up a parameter.
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    /// Variables in sorted name order.
    pub fn vars(&self) -> Vec<Var> {
        self.vars.values().cloned().collect()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of scalar weights.
    pub fn num_weights(&self) -> usize {
        self.vars.values().map(|v| v.elem_count()).sum()
    }

    /// Current values, detached, for serialization.
    pub fn tensors(&self) -> BTreeMap<String, Tensor> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect()
    }

    /// Overwrites every parameter from `tensors`. Missing or extra names and
    /// shape mismatches are configuration errors.
    pub fn load(&mut self, tensors: &BTreeMap<String, Tensor>) -> Result<()> {
        for name in tensors.keys() {
            if !self.vars.contains_key(name) {
                return Err(KairoError::config(format!(
                    "checkpoint has unknown parameter {name:?}"
                )));
            }
        }
        for (name, var) in &self.vars {
            let tensor = tensors.get(name).ok_or_else(|| {
                KairoError::config(format!("checkpoint lacks parameter {name:?}"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(KairoError::config(format!(
                    "parameter {name:?}: checkpoint shape {:?}, network shape {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(DType::F32)?.to_device(&self.device)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_depends_on_seed_and_name_only() {
        let mut a = ParamStore::new(42, Device::Cpu);
        let mut b = ParamStore::new(42, Device::Cpu);
        let init = Init::Glorot {
            fan_in: 3,
            fan_out: 2,
        };
        b.get_or_init("other", &[4], init).unwrap();
        let wa = a.get_or_init("layer/W", &[2, 3], init).unwrap();
        let wb = b.get_or_init("layer/W", &[2, 3], init).unwrap();
        assert_eq!(
            wa.to_vec2::<f32>().unwrap(),
            wb.to_vec2::<f32>().unwrap()
        );

        let limit = (6.0f32 / 5.0).sqrt();
        assert!(wa
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.abs() <= limit));

        let mut c = ParamStore::new(43, Device::Cpu);
        let wc = c.get_or_init("layer/W", &[2, 3], init).unwrap();
        assert_ne!(wa.to_vec2::<f32>().unwrap(), wc.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn shape_conflict_is_config_error() {
        let mut store = ParamStore::new(0, Device::Cpu);
        store.get_or_init("b", &[3], Init::Const(0.0)).unwrap();
        assert!(store.get_or_init("b", &[3], Init::Const(1.0)).is_ok());
        assert!(matches!(
            store.get_or_init("b", &[4], Init::Const(0.0)),
            Err(KairoError::Config(_))
        ));
    }

    #[test]
    fn load_overwrites_values() {
        let mut store = ParamStore::new(0, Device::Cpu);
        store.get_or_init("b", &[2], Init::Const(0.0)).unwrap();
        let saved = BTreeMap::from([(
            "b".to_string(),
            Tensor::new(&[1.5f32, -2.0], &Device::Cpu).unwrap(),
        )]);
        store.load(&saved).unwrap();
        assert_eq!(store.get("b").unwrap().to_vec1::<f32>().unwrap(), vec![1.5, -2.0]);

        let wrong = BTreeMap::from([(
            "b".to_string(),
            Tensor::new(&[1.0f32], &Device::Cpu).unwrap(),
        )]);
        assert!(store.load(&wrong).is_err());
        assert!(store.load(&BTreeMap::new()).is_err());
    }
}
