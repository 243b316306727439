//! # Network
//!
//! A network is built from a JSON layer dict: output contracts are inferred
//! first, then layers are created in dependency order with their parameters
//! in a shared [`ParamStore`]. [`Network::forward`] evaluates every layer on
//! one fed batch and collects losses against the fed targets.

pub mod beam;
pub(crate) mod graph;
pub mod layer;
pub mod layers;
pub mod params;
pub mod rec;
pub mod registry;
pub mod value;

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use oorandom::Rand32;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::data::extern_data::{DataSpec, ExternData};
use crate::data::feeder::FeedDict;
use crate::error::{KairoError, Result};

pub use beam::{BeamState, best_rows};
pub use layer::{ForwardEnv, Layer, LayerOpts, LayerRef, LossValue, RunMode};
pub use params::{Init, ParamStore};
pub use registry::{BuildEnv, LayerClass, LayerRegistry, NetCtx};
pub use value::{BeamInfo, Data};

use graph::{GraphScope, LayerDefs};

/// Layer whose output is taken when none is named.
pub const DEFAULT_OUTPUT_LAYER: &str = "output";

/// A built network.
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    extern_data: ExternData,
    device: Device,
}

impl Network {
    /// Builds every layer of `net`, creating missing parameters in `params`.
    pub fn build(
        net: &Value,
        extern_data: &ExternData,
        registry: &LayerRegistry,
        params: &mut ParamStore,
    ) -> Result<Self> {
        let map = net
            .as_object()
            .ok_or_else(|| KairoError::config("network must be a JSON object of layers"))?;
        if map.is_empty() {
            return Err(KairoError::config("network has no layers"));
        }
        let defs = LayerDefs::from_map(map)?;
        let mut scope = GraphScope::top(&defs, registry.clone(), extern_data);
        let layers = scope.build_layers(params, "")?;
        debug!(
            layers = layers.len(),
            params = params.len(),
            weights = params.num_weights(),
            "network built"
        );
        Ok(Self {
            layers,
            extern_data: extern_data.clone(),
            device: params.device().clone(),
        })
    }

    /// Builds the network stored under `network` in the configuration.
    pub fn from_config(
        config: &Config,
        extern_data: &ExternData,
        params: &mut ParamStore,
    ) -> Result<Self> {
        let json = config
            .network_json()
            .ok_or_else(|| KairoError::config("no network defined"))?;
        let net: Value = serde_json::from_str(&json)
            .map_err(|e| KairoError::config(format!("network is not valid JSON: {e}")))?;
        Self::build(&net, extern_data, &LayerRegistry::with_builtin(), params)
    }

    /// Layer names in evaluation order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Output contract of a layer.
    pub fn output_spec(&self, name: &str) -> Result<&DataSpec> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .map(|l| l.output_spec())
            .ok_or_else(|| KairoError::config(format!("no layer {name:?} in the network")))
    }

    /// The data contracts the network was built against.
    pub fn extern_data(&self) -> &ExternData {
        &self.extern_data
    }

    /// Whether any layer has a loss.
    pub fn has_loss(&self) -> bool {
        self.layers.iter().any(|l| l.target().is_some())
    }

    /// Evaluates the network on one batch. `seed` drives dropout.
    pub fn forward(&self, feed: &FeedDict, mode: RunMode, seed: u64) -> Result<RunOutputs> {
        let externs: BTreeMap<String, Data> = feed
            .data
            .iter()
            .map(|(key, tensor)| (key.clone(), Data::from_feed(tensor)))
            .collect();
        let mut values = BTreeMap::new();
        let prev_states = BTreeMap::new();
        let mut new_states = BTreeMap::new();
        let mut rng = Rand32::new(seed);
        let mut sub_losses = Vec::new();

        for layer in &self.layers {
            let out = {
                let mut env = ForwardEnv {
                    mode,
                    step: None,
                    values: &values,
                    prev: None,
                    base: None,
                    base_rows: None,
                    externs: &externs,
                    unit_input: None,
                    prev_states: &prev_states,
                    new_states: &mut new_states,
                    beam: None,
                    greedy: false,
                    rng: &mut rng,
                    sub_losses: &mut sub_losses,
                };
                layer.forward(&mut env)?
            };
            values.insert(layer.name().to_string(), out);
        }

        let mut losses = Vec::new();
        for layer in &self.layers {
            let Some(key) = layer.target() else {
                continue;
            };
            let (Some(output), Some(target)) = (values.get(layer.name()), externs.get(key)) else {
                continue;
            };
            if output.beam.as_ref().is_some_and(|b| b.width > 1) {
                continue;
            }
            if let Some(loss) = layer.loss(output, target)? {
                losses.push((layer.name().to_string(), loss));
            }
        }
        losses.extend(sub_losses);

        let mut l2: Option<Tensor> = None;
        if mode.is_train() {
            for layer in &self.layers {
                if let Some(term) = layer.l2_penalty()? {
                    l2 = Some(match l2 {
                        Some(t) => (t + term)?,
                        None => term,
                    });
                }
            }
        }

        Ok(RunOutputs {
            values,
            losses,
            l2,
            device: self.device.clone(),
        })
    }
}

/// Loss and error sums of one layer over one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LossSums {
    /// Layer name, `<rec>/<layer>` for losses inside recurrent units.
    pub name: String,
    /// Summed loss, if the layer has a differentiable loss.
    pub loss: Option<f64>,
    /// Summed error.
    pub error: Option<f64>,
    /// Frames the sums run over.
    pub frames: usize,
}

/// Everything one forward call produced.
pub struct RunOutputs {
    values: BTreeMap<String, Data>,
    losses: Vec<(String, LossValue)>,
    l2: Option<Tensor>,
    device: Device,
}

impl RunOutputs {
    /// Total objective: the frame-normalized loss of every layer plus weight
    /// decay. Zero when nothing has a loss.
    pub fn loss(&self) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (_, lv) in &self.losses {
            let Some(loss) = &lv.loss else {
                continue;
            };
            let term = loss.affine(1.0 / lv.frames.max(1) as f64, 0.0)?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
        if let Some(l2) = &self.l2 {
            total = Some(match total {
                Some(t) => (t + l2)?,
                None => l2.clone(),
            });
        }
        match total {
            Some(t) => Ok(t),
            None => Ok(Tensor::zeros((), DType::F32, &self.device)?),
        }
    }

    /// Whether any layer produced a differentiable loss.
    pub fn has_loss(&self) -> bool {
        self.losses.iter().any(|(_, lv)| lv.loss.is_some())
    }

    /// Output of a layer.
    pub fn output(&self, name: &str) -> Result<&Data> {
        self.values
            .get(name)
            .ok_or_else(|| KairoError::config(format!("no output of layer {name:?}")))
    }

    /// Frame-normalized loss per layer.
    pub fn loss_by_layer(&self) -> Result<BTreeMap<String, f64>> {
        let mut out = BTreeMap::new();
        for (name, lv) in &self.losses {
            if let Some(sum) = lv.loss_sum()? {
                out.insert(name.clone(), sum / lv.frames.max(1) as f64);
            }
        }
        Ok(out)
    }

    /// Frame-normalized error per layer.
    pub fn error_by_layer(&self) -> BTreeMap<String, f64> {
        self.losses
            .iter()
            .filter_map(|(name, lv)| {
                lv.error
                    .map(|e| (name.clone(), e / lv.frames.max(1) as f64))
            })
            .collect()
    }

    /// Raw sums for accumulating over several batches.
    pub fn sums(&self) -> Result<Vec<LossSums>> {
        self.losses
            .iter()
            .map(|(name, lv)| {
                Ok(LossSums {
                    name: name.clone(),
                    loss: lv.loss_sum()?,
                    error: lv.error,
                    frames: lv.frames,
                })
            })
            .collect()
    }
}
