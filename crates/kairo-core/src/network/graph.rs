//! Graph construction: output inference with cycle detection, evaluation
//! order and layer creation, shared by the top-level network and recurrent
//! units.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::data::extern_data::{DEFAULT_INPUT_KEY, DataSpec, ExternData};
use crate::error::{KairoError, Result};
use crate::network::layer::{Layer, LayerOpts, LayerRef};
use crate::network::params::ParamStore;
use crate::network::registry::{BuildEnv, LayerRegistry, NetCtx};

/// Layer definitions of one network level in insertion order.
#[derive(Debug, Clone)]
pub(crate) struct LayerDefs {
    order: Vec<String>,
    opts: BTreeMap<String, LayerOpts>,
}

impl LayerDefs {
    pub(crate) fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let mut order = Vec::with_capacity(map.len());
        let mut opts = BTreeMap::new();
        for (name, def) in map {
            order.push(name.clone());
            opts.insert(name.clone(), LayerOpts::new(name, def)?);
        }
        Ok(Self { order, opts })
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.opts.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Result<&LayerOpts> {
        self.opts
            .get(name)
            .ok_or_else(|| KairoError::config(format!("unknown layer {name:?}")))
    }
}

/// Resolution scope of one network level.
pub(crate) struct GraphScope<'p> {
    defs: &'p LayerDefs,
    registry: LayerRegistry,
    extern_data: Option<&'p ExternData>,
    parent: Option<&'p mut dyn NetCtx>,
    unit_input: Option<DataSpec>,
    specs: BTreeMap<String, DataSpec>,
    in_progress: Vec<String>,
}

impl<'p> GraphScope<'p> {
    /// Scope of a top-level network.
    pub(crate) fn top(defs: &'p LayerDefs, registry: LayerRegistry, extern_data: &'p ExternData) -> Self {
        Self {
            defs,
            registry,
            extern_data: Some(extern_data),
            parent: None,
            unit_input: None,
            specs: BTreeMap::new(),
            in_progress: Vec::new(),
        }
    }

    /// Scope of a recurrent unit. `unit_input` is the per-step contract of
    /// the recurrent layer's sources, if it has any.
    pub(crate) fn unit(
        defs: &'p LayerDefs,
        registry: LayerRegistry,
        parent: &'p mut dyn NetCtx,
        unit_input: Option<DataSpec>,
    ) -> Self {
        Self {
            defs,
            registry,
            extern_data: None,
            parent: Some(parent),
            unit_input: unit_input.map(DataSpec::without_time),
            specs: BTreeMap::new(),
            in_progress: Vec::new(),
        }
    }

    fn is_unit(&self) -> bool {
        self.parent.is_some()
    }

    /// Output contract of a layer at this level, inferring it on first use.
    pub(crate) fn infer(&mut self, name: &str) -> Result<DataSpec> {
        if let Some(spec) = self.specs.get(name) {
            return Ok(spec.clone());
        }
        let defs = self.defs;
        let opts = defs.get(name)?;
        if let Some(pos) = self.in_progress.iter().position(|n| n == name) {
            let mut chain = self.in_progress[pos..].to_vec();
            chain.push(name.to_string());
            return Err(KairoError::config(format!(
                "cannot infer the output of {name:?}: cyclic dependency {}; \
                 set n_out or out_type on a layer in the cycle",
                chain.join(" -> ")
            )));
        }
        let class = *self.registry.get(opts.class()?)?;
        self.in_progress.push(name.to_string());
        let inferred = (class.infer)(opts, self);
        self.in_progress.pop();
        let spec = inferred?.renamed(name);
        let spec = if self.is_unit() { spec.without_time() } else { spec };
        self.specs.insert(name.to_string(), spec.clone());
        Ok(spec)
    }

    /// Evaluation order: dependencies first, ties by insertion order. A
    /// cycle not broken by `prev:` is a configuration error.
    pub(crate) fn topo_order(&mut self) -> Result<Vec<String>> {
        let defs = self.defs;
        let in_unit = self.is_unit();
        let mut order = Vec::with_capacity(defs.order.len());
        let mut done = BTreeSet::new();
        let mut stack: Vec<String> = Vec::new();

        fn visit(
            name: &str,
            defs: &LayerDefs,
            in_unit: bool,
            done: &mut BTreeSet<String>,
            stack: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if let Some(pos) = stack.iter().position(|n| n == name) {
                let mut chain = stack[pos..].to_vec();
                chain.push(name.to_string());
                return Err(KairoError::config(format!(
                    "dependency cycle: {}",
                    chain.join(" -> ")
                )));
            }
            stack.push(name.to_string());
            for r in defs.get(name)?.refs(in_unit)? {
                match &r {
                    LayerRef::Layer(dep) => {
                        if !defs.contains(dep) {
                            return Err(KairoError::config(format!(
                                "layer {name:?} references unknown layer {dep:?}"
                            )));
                        }
                        visit(dep, defs, in_unit, done, stack, order)?;
                    }
                    LayerRef::Prev(dep) => {
                        if !in_unit {
                            return Err(KairoError::config(format!(
                                "layer {name:?}: {r} is only valid inside a recurrent unit"
                            )));
                        }
                        if !defs.contains(dep) {
                            return Err(KairoError::config(format!(
                                "layer {name:?} references unknown layer {dep:?}"
                            )));
                        }
                    }
                    LayerRef::Base(_) if !in_unit => {
                        return Err(KairoError::config(format!(
                            "layer {name:?}: {r} is only valid inside a recurrent unit"
                        )));
                    }
                    LayerRef::Base(_) | LayerRef::Data(_) => {}
                }
            }
            stack.pop();
            done.insert(name.to_string());
            order.push(name.to_string());
            Ok(())
        }

        for name in &defs.order {
            visit(name, defs, in_unit, &mut done, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    /// Infers, orders and creates every layer of this level.
    pub(crate) fn build_layers(
        &mut self,
        params: &mut ParamStore,
        prefix: &str,
    ) -> Result<Vec<Box<dyn Layer>>> {
        let order = self.topo_order()?;
        let defs = self.defs;
        let registry = self.registry.clone();
        let mut layers = Vec::with_capacity(order.len());
        for name in &order {
            let output = self.infer(name)?;
            let opts = defs.get(name)?;
            let class = *registry.get(opts.class()?)?;
            let mut env = BuildEnv {
                ctx: &mut *self,
                params: &mut *params,
                registry: registry.clone(),
                prefix: prefix.to_string(),
                output,
            };
            let layer = (class.build)(opts, &mut env)?;
            for r in layer.dependencies() {
                self.spec(&r)?;
            }
            layers.push(layer);
        }
        Ok(layers)
    }
}

impl NetCtx for GraphScope<'_> {
    fn spec(&mut self, r: &LayerRef) -> Result<DataSpec> {
        match r {
            LayerRef::Layer(name) => {
                if !self.defs.contains(name) && self.is_unit() {
                    return Err(KairoError::config(format!(
                        "unknown layer {name:?} in recurrent unit (use base:{name} for outer layers)"
                    )));
                }
                self.infer(name)
            }
            LayerRef::Prev(name) => {
                if !self.is_unit() {
                    return Err(KairoError::config(format!(
                        "{r} is only valid inside a recurrent unit"
                    )));
                }
                self.infer(name)
            }
            LayerRef::Base(name) => match self.parent.as_deref_mut() {
                Some(parent) => parent.spec(&LayerRef::Layer(name.clone())),
                None => Err(KairoError::config(format!(
                    "{r} is only valid inside a recurrent unit"
                ))),
            },
            LayerRef::Data(key) => {
                if let Some(parent) = self.parent.as_deref_mut() {
                    if key == DEFAULT_INPUT_KEY || key == "source" {
                        return self.unit_input.clone().ok_or_else(|| {
                            KairoError::config(format!(
                                "{r}: the recurrent layer has no sources"
                            ))
                        });
                    }
                    return Ok(parent.spec(r)?.without_time());
                }
                match self.extern_data {
                    Some(extern_data) => Ok(extern_data.get(key)?.clone()),
                    None => Err(KairoError::config(format!("unknown data key {key:?}"))),
                }
            }
        }
    }

    fn in_unit(&self) -> bool {
        self.is_unit()
    }

    fn registry(&self) -> LayerRegistry {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn defs(value: Value) -> LayerDefs {
        LayerDefs::from_map(value.as_object().unwrap()).unwrap()
    }

    fn extern_data() -> ExternData {
        let mut extern_data = ExternData::new();
        extern_data.register(DataSpec::dense("data", 3));
        extern_data.register(DataSpec::sparse("classes", 4));
        extern_data
    }

    #[test]
    fn order_puts_dependencies_first() {
        let defs = defs(json!({
            "output": {"class": "softmax", "from": ["b"], "loss": "ce", "target": "classes"},
            "a": {"class": "linear", "n_out": 2},
            "b": {"class": "copy", "from": ["a"]}
        }));
        let extern_data = extern_data();
        let mut scope = GraphScope::top(&defs, LayerRegistry::with_builtin(), &extern_data);
        assert_eq!(scope.topo_order().unwrap(), vec!["a", "b", "output"]);
        assert_eq!(scope.infer("output").unwrap().dim, 4);
        assert_eq!(scope.infer("b").unwrap().dim, 2);
    }

    #[test]
    fn cycles_and_bad_references_are_config_errors() {
        let extern_data = extern_data();
        let cyclic = defs(json!({
            "a": {"class": "copy", "from": ["b"]},
            "b": {"class": "copy", "from": ["a"]}
        }));
        let mut scope = GraphScope::top(&cyclic, LayerRegistry::with_builtin(), &extern_data);
        let err = scope.topo_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let unknown = defs(json!({"a": {"class": "copy", "from": ["zzz"]}}));
        let mut scope = GraphScope::top(&unknown, LayerRegistry::with_builtin(), &extern_data);
        assert!(scope.topo_order().is_err());

        let prev = defs(json!({"a": {"class": "copy", "from": ["prev:a"]}}));
        let mut scope = GraphScope::top(&prev, LayerRegistry::with_builtin(), &extern_data);
        assert!(matches!(scope.topo_order(), Err(KairoError::Config(_))));

        let class = defs(json!({"a": {"class": "teleport"}}));
        let mut scope = GraphScope::top(&class, LayerRegistry::with_builtin(), &extern_data);
        assert!(scope.infer("a").is_err());
    }
}
