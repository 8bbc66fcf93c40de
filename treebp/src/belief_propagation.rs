use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, trace, warn};
use ndarray::Array1;
use thiserror::Error;

use crate::distribution::{Distribution, DistributionError, Message};
use crate::factor_graph::{FGError, FactorGraph, FactorId, Node, VarId};
use crate::Config;

/// Directed edge along which a message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MessageKey {
    pub from: Node,
    pub to: Node,
}

impl MessageKey {
    pub fn new(from: Node, to: Node) -> Self {
        Self { from, to }
    }
}

/// A cached message, with its endpoints given by name.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    pub from: String,
    pub to: String,
    pub message: Message,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BPError {
    #[error(transparent)]
    Graph(#[from] FGError),
    #[error(transparent)]
    Distribution(#[from] DistributionError),
    #[error("Impossible evidence: the marginal of {0} has no mass.")]
    DegenerateEvidence(String),
    #[error("No edge between {from} and {to}.")]
    NotAdjacent { from: String, to: String },
    #[error("No distribution bound to factor {0}.")]
    UnboundFactor(String),
    #[error("Cannot run acyclic BP on a cyclic graph: message {from} -> {to} depends on itself.")]
    NotAcyclic { from: String, to: String },
}

type Result<T> = std::result::Result<T, BPError>;

/// Sum-product messages over a tree-shaped factor graph.
///
/// Messages are computed on demand and kept for the lifetime of the instance. The bound tables
/// of the graph are never modified: factor messages are computed on a private copy.
#[derive(Debug, Clone)]
pub struct Messages {
    graph: Arc<FactorGraph>,
    config: Config,
    cache: IndexMap<MessageKey, Message>,
}

impl Messages {
    pub fn new(graph: Arc<FactorGraph>) -> Self {
        Self::with_config(graph, Config::default())
    }
    pub fn with_config(graph: Arc<FactorGraph>, config: Config) -> Self {
        Self {
            graph,
            config,
            cache: IndexMap::new(),
        }
    }
    pub fn graph(&self) -> &Arc<FactorGraph> {
        &self.graph
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// All the messages computed so far, in order of computation.
    pub fn cache(&self) -> &IndexMap<MessageKey, Message> {
        &self.cache
    }
    pub fn len(&self) -> usize {
        self.cache.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
    pub fn message(&self, from: Node, to: Node) -> Option<&Message> {
        self.cache.get(&MessageKey::new(from, to))
    }
    pub fn dump(&self) -> Vec<MessageRecord> {
        self.cache
            .iter()
            .map(|(key, message)| MessageRecord {
                from: self.graph.node_name(key.from).to_owned(),
                to: self.graph.node_name(key.to).to_owned(),
                message: message.clone(),
            })
            .collect()
    }

    fn not_adjacent(&self, key: MessageKey) -> BPError {
        BPError::NotAdjacent {
            from: self.graph.node_name(key.from).to_owned(),
            to: self.graph.node_name(key.to).to_owned(),
        }
    }
    fn check_edge(&self, key: MessageKey) -> Result<()> {
        self.graph.check_node(key.from)?;
        self.graph.check_node(key.to)?;
        if self.graph.are_adjacent(key.from, key.to) {
            Ok(())
        } else {
            Err(self.not_adjacent(key))
        }
    }

    // For both kinds of nodes, the message `from -> to` is a function of the messages sent to
    // `from` by its other neighbors.
    fn dependencies(&self, key: MessageKey) -> impl Iterator<Item = MessageKey> + '_ {
        self.graph
            .neighbors(key.from)
            .filter(move |n| *n != key.to)
            .map(move |n| MessageKey::new(n, key.from))
    }

    // All dependencies must be cached. Messages are only defined up to scale: vectors are
    // rescaled to sum to one, except when they carry no mass.
    fn compute(&self, key: MessageKey) -> Result<Message> {
        trace!(
            "Computing message {} -> {}.",
            self.graph.node_name(key.from),
            self.graph.node_name(key.to)
        );
        match (key.from, key.to) {
            (Node::Var(_), Node::Factor(_)) => {
                let incoming = self.dependencies(key).map(|k| &self.cache[&k]);
                Ok(Message::product(incoming).map_or(Message::Unit, Message::normalized))
            }
            (Node::Factor(factor), Node::Var(var)) => {
                let mut acc: Distribution = self
                    .graph
                    .factor_data(factor)
                    .ok_or_else(|| {
                        BPError::UnboundFactor(self.graph.factor_name(factor).to_owned())
                    })?
                    .clone();
                for dep in self.dependencies(key) {
                    if let (Node::Var(u), Message::Vector(msg)) = (dep.from, &self.cache[&dep]) {
                        let msg = Distribution::from_vector(msg.clone(), self.graph.var_name(u))?;
                        acc.multiply_assign(&msg)?;
                    }
                }
                Ok(Message::normalized(acc.sum_to(self.graph.var_name(var))?))
            }
            _ => Err(self.not_adjacent(key)),
        }
    }

    // Compute `target` and every message it depends on, with an explicit stack.
    fn ensure(&mut self, target: MessageKey) -> Result<()> {
        if self.cache.contains_key(&target) {
            return Ok(());
        }
        let mut visit_stack = vec![target];
        let mut pending = HashSet::from([target]);
        while let Some(&key) = visit_stack.last() {
            let missing: Vec<MessageKey> = self
                .dependencies(key)
                .filter(|d| !self.cache.contains_key(d))
                .collect();
            if missing.is_empty() {
                let msg = self.compute(key)?;
                self.cache.insert(key, msg);
                visit_stack.pop();
                pending.remove(&key);
            } else {
                for dep in missing {
                    // On a tree, the dependencies of distinct pending messages are disjoint.
                    if !pending.insert(dep) {
                        return Err(BPError::NotAcyclic {
                            from: self.graph.node_name(dep.from).to_owned(),
                            to: self.graph.node_name(dep.to).to_owned(),
                        });
                    }
                    visit_stack.push(dep);
                }
            }
        }
        Ok(())
    }

    fn get(&mut self, key: MessageKey) -> Result<&Message> {
        self.check_edge(key)?;
        self.ensure(key)?;
        Ok(&self.cache[&key])
    }

    /// Product of the messages `var` receives from all its factors but `factor`
    /// ([`Message::Unit`] if there is none).
    pub fn variable_to_factor(&mut self, var: VarId, factor: FactorId) -> Result<&Message> {
        self.get(MessageKey::new(Node::Var(var), Node::Factor(factor)))
    }

    /// Table of `factor` times the messages it receives from all its variables but `var`,
    /// summed over every axis but `var`.
    pub fn factor_to_variable(&mut self, factor: FactorId, var: VarId) -> Result<&Message> {
        self.get(MessageKey::new(Node::Factor(factor), Node::Var(var)))
    }

    /// Normalized product of the messages `var` receives from all its factors.
    pub fn marginal(&mut self, var: VarId) -> Result<Array1<f64>> {
        self.graph.check_node(Node::Var(var))?;
        let graph = self.graph.clone();
        for factor in graph.var(var).factors() {
            self.ensure(MessageKey::new(Node::Factor(*factor), Node::Var(var)))?;
        }
        let incoming = graph
            .var(var)
            .factors()
            .iter()
            .map(|f| &self.cache[&MessageKey::new(Node::Factor(*f), Node::Var(var))]);
        let unnormalized = Message::product(incoming)
            .ok_or_else(|| BPError::DegenerateEvidence(graph.var_name(var).to_owned()))?;
        let total = unnormalized.sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(BPError::DegenerateEvidence(graph.var_name(var).to_owned()));
        }
        Ok(unnormalized.mapv_into(|x| x / total))
    }

    pub fn marginal_by_name(&mut self, var: &str) -> Result<Array1<f64>> {
        let var = self.graph.var_id(var)?;
        self.marginal(var)
    }

    /// Compute the messages from every factor to its variables, then from every variable to its
    /// factors.
    pub fn forward(&mut self) -> Result<()> {
        let graph = self.graph.clone();
        for (factor_id, factor) in graph.factors().iter().enumerate() {
            for var in factor.vars() {
                self.ensure(MessageKey::new(Node::Factor(factor_id), Node::Var(*var)))?;
            }
        }
        for var_id in 0..graph.n_vars() {
            for factor in graph.var(var_id).factors() {
                self.ensure(MessageKey::new(Node::Var(var_id), Node::Factor(*factor)))?;
            }
        }
        Ok(())
    }

    /// Same messages as [`Messages::forward`], in reverse order.
    pub fn backward(&mut self) -> Result<()> {
        let graph = self.graph.clone();
        for var_id in (0..graph.n_vars()).rev() {
            for factor in graph.var(var_id).factors().iter().rev() {
                self.ensure(MessageKey::new(Node::Var(var_id), Node::Factor(*factor)))?;
            }
        }
        for (factor_id, factor) in graph.factors().iter().enumerate().rev() {
            for var in factor.vars().iter().rev() {
                self.ensure(MessageKey::new(Node::Factor(factor_id), Node::Var(*var)))?;
            }
        }
        Ok(())
    }

    /// Marginals of all the variables, by name.
    pub fn belief_propagation(&mut self) -> Result<IndexMap<String, Array1<f64>>> {
        let graph = self.graph.clone();
        if self.config.check_tree {
            graph.check_tree()?;
        }
        for factor in graph.check_conditionals(self.config.tolerance) {
            warn!("Distribution of {} is not normalized.", factor);
        }
        self.forward()?;
        self.backward()?;
        debug!(
            "Propagated {} messages over {} variables and {} factors.",
            self.cache.len(),
            graph.n_vars(),
            graph.n_factors()
        );
        (0..graph.n_vars())
            .map(|v| Ok((graph.var_name(v).to_owned(), self.marginal(v)?)))
            .collect()
    }
}
