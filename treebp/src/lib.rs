pub mod belief_propagation;
pub mod distribution;
pub mod factor_graph;
mod fg_parser;

pub use belief_propagation::{BPError, MessageKey, MessageRecord, Messages};
pub use distribution::{Distribution, DistributionError, Message, DEFAULT_TOLERANCE};
pub use factor_graph::{FGError, Factor, FactorGraph, FactorId, Node, Var, VarId};

type NamedList<T> = indexmap::IndexMap<String, T>;

/// Checks done by [`Messages::belief_propagation`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Verify that the graph is a forest before a full propagation.
    pub check_tree: bool,
    /// Tolerance of the normalization checks done before a full propagation. Failures are only
    /// logged: evidence factors are not normalized in general.
    pub tolerance: f64,
}

impl Config {
    /// Tree check enabled, normalization checked to [`DEFAULT_TOLERANCE`].
    pub fn with_default_checks() -> Self {
        Self {
            check_tree: true,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
    /// Skip the tree check. Cycles are then only found while computing messages.
    pub fn unchecked() -> Self {
        Self {
            check_tree: false,
            ..Self::with_default_checks()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_default_checks()
    }
}

/// Marginals of all the variables of `graph`, by name.
pub fn belief_propagation(
    graph: std::sync::Arc<FactorGraph>,
) -> Result<indexmap::IndexMap<String, ndarray::Array1<f64>>, BPError> {
    Messages::new(graph).belief_propagation()
}
