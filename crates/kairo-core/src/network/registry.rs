//! Layer class registry and the build-time context layers are created in.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::extern_data::DataSpec;
use crate::error::{KairoError, Result};
use crate::network::layer::{Layer, LayerOpts, LayerRef};
use crate::network::layers;
use crate::network::params::ParamStore;

/// Resolves the output contracts of references while a network is built.
pub trait NetCtx {
    /// Output contract of the referenced value.
    fn spec(&mut self, r: &LayerRef) -> Result<DataSpec>;

    /// Whether definitions are inside a recurrent unit.
    fn in_unit(&self) -> bool;

    /// Classes available for nested networks.
    fn registry(&self) -> LayerRegistry;
}

/// Infers a layer's output contract from its options and sources.
pub type InferFn = fn(&LayerOpts, &mut dyn NetCtx) -> Result<DataSpec>;

/// Creates a layer once its output contract is known.
pub type BuildFn = fn(&LayerOpts, &mut BuildEnv<'_>) -> Result<Box<dyn Layer>>;

/// A registered layer class.
#[derive(Debug, Clone, Copy)]
pub struct LayerClass {
    /// Name used in `class` options.
    pub name: &'static str,
    /// Output inference.
    pub infer: InferFn,
    /// Construction.
    pub build: BuildFn,
}

/// Layer class name → class.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    classes: Arc<BTreeMap<&'static str, LayerClass>>,
}

impl LayerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in class.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for class in layers::builtin() {
            registry.register(class);
        }
        registry
    }

    /// Adds or replaces a class.
    pub fn register(&mut self, class: LayerClass) {
        Arc::make_mut(&mut self.classes).insert(class.name, class);
    }

    /// Looks up a class.
    pub fn get(&self, name: &str) -> Result<&LayerClass> {
        self.classes
            .get(name)
            .ok_or_else(|| KairoError::config(format!("unknown layer class {name:?}")))
    }

    /// Registered class names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.classes.keys().copied().collect()
    }
}

/// Build-time environment handed to [`BuildFn`]s.
pub struct BuildEnv<'a> {
    /// Contract resolution at the layer's level.
    pub ctx: &'a mut dyn NetCtx,
    /// Parameter store new weights are created in.
    pub params: &'a mut ParamStore,
    /// Classes for nested networks.
    pub registry: LayerRegistry,
    /// Prefix of parameter names at this level, e.g. `dec/`.
    pub prefix: String,
    /// The inferred output contract.
    pub output: DataSpec,
}

impl BuildEnv<'_> {
    /// Parameter name `<prefix><layer>/<suffix>`.
    pub fn param_name(&self, layer: &str, suffix: &str) -> String {
        format!("{}{layer}/{suffix}", self.prefix)
    }

    /// Contracts of several references.
    pub fn specs(&mut self, refs: &[LayerRef]) -> Result<Vec<DataSpec>> {
        refs.iter().map(|r| self.ctx.spec(r)).collect()
    }
}

/// Contract of the feature-axis concatenation of `specs`: a single source is
/// passed through, several become one dense stream.
pub fn combined_spec(name: &str, specs: &[DataSpec]) -> Result<DataSpec> {
    match specs {
        [] => Err(KairoError::config(format!("layer {name:?} has no sources"))),
        [single] => Ok(single.renamed(name)),
        many => {
            let time_axis = many[0].time_axis;
            if many.iter().any(|s| s.time_axis != time_axis) {
                return Err(KairoError::config(format!(
                    "layer {name:?}: sources disagree on the time axis"
                )));
            }
            let dim = many.iter().map(|s| s.dim).sum();
            let spec = DataSpec::dense(name, dim);
            Ok(if time_axis { spec } else { spec.without_time() })
        }
    }
}

/// Width of the dense concatenation of `specs`, sparse sources counted as
/// one-hot.
pub fn input_dim(specs: &[DataSpec]) -> usize {
    specs.iter().map(|s| s.dim).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_classes_are_registered() {
        let registry = LayerRegistry::with_builtin();
        for name in [
            "linear",
            "softmax",
            "activation",
            "copy",
            "compare",
            "rnn_cell",
            "rec",
            "dot_attention",
            "choice",
            "decide",
            "get_last_hidden_state",
        ] {
            assert!(registry.get(name).is_ok(), "missing class {name}");
        }
        assert!(matches!(registry.get("conv"), Err(KairoError::Config(_))));
    }

    #[test]
    fn combined_spec_concatenates_dense() {
        let specs = vec![DataSpec::dense("a", 3), DataSpec::sparse("b", 4)];
        let spec = combined_spec("c", &specs).unwrap();
        assert_eq!(spec.dim, 7);
        assert!(!spec.sparse);

        let single = combined_spec("c", &specs[1..]).unwrap();
        assert!(single.sparse);
        assert_eq!(single.name, "c");

        let mixed = vec![DataSpec::dense("a", 3), DataSpec::dense("b", 1).without_time()];
        assert!(combined_spec("c", &mixed).is_err());
    }
}
