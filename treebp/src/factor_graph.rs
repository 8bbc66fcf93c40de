use std::collections::HashMap;

use itertools::{Either, Itertools};
use log::{debug, warn};
use thiserror::Error;

use crate::distribution::Distribution;
use crate::fg_parser;
use crate::NamedList;

pub type VarId = usize;
pub type FactorId = usize;

/// A node of the bipartite factor graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Node {
    Var(VarId),
    Factor(FactorId),
}

#[derive(Debug, Clone, Default)]
pub struct Var {
    // Adjacent factors, in order of appearance in the factorization.
    factors: Vec<FactorId>,
    // Number of states, known once distributions are bound.
    nc: Option<usize>,
}

impl Var {
    pub fn factors(&self) -> &[FactorId] {
        self.factors.as_slice()
    }
    pub fn cardinality(&self) -> Option<usize> {
        self.nc
    }
}

#[derive(Debug, Clone)]
pub struct Factor {
    name: String,
    // Left-hand side of the term.
    head: Vec<VarId>,
    conditional: bool,
    // Whole scope of the term.
    vars: Vec<VarId>,
    data: Option<Distribution>,
}

impl Factor {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
    pub fn vars(&self) -> &[VarId] {
        self.vars.as_slice()
    }
    pub fn data(&self) -> Option<&Distribution> {
        self.data.as_ref()
    }
    /// True for `p(a|b)` terms, false for `p(a,b)`.
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FGError {
    #[error("Invalid factorization:\n{0}")]
    Parse(String),
    #[error("No variable named {0}.")]
    UnknownVariable(String),
    #[error("No factor named {0}.")]
    UnknownFactor(String),
    #[error("No distribution given for factor {0}.")]
    MissingFactorData(String),
    #[error(
        "Axes of the distribution of {factor} do not match its variables \
         (missing: [{}], unexpected: [{}]).",
        .missing.join(", "),
        .extra.join(", ")
    )]
    AxesMismatch {
        factor: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    #[error("Variable {var} has {found} states in factor {factor}, expected {expected}.")]
    InconsistentCardinality {
        factor: String,
        var: String,
        found: usize,
        expected: usize,
    },
    #[error("The factor graph is not a tree: {0} lies on a cycle.")]
    Cyclic(String),
    #[error("Variable id {0} is out of range.")]
    InvalidVarId(VarId),
    #[error("Factor id {0} is out of range.")]
    InvalidFactorId(FactorId),
}

type Result<T> = std::result::Result<T, FGError>;

/// Variables and factors of a factorization, with the tables bound to each factor.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    vars: NamedList<Var>,
    factors: Vec<Factor>,
}

impl FactorGraph {
    /// Build the (unbound) graph of a factorization such as `p(h1)p(h2|h1)`.
    pub fn from_factorization(description: &str) -> Result<Self> {
        let terms = fg_parser::parse(description).map_err(FGError::Parse)?;
        let mut graph = Self::default();
        for term in terms.iter() {
            graph.add_factor(term);
        }
        debug!(
            "Built factor graph with {} variables and {} factors.",
            graph.vars.len(),
            graph.factors.len()
        );
        Ok(graph)
    }

    fn add_var(&mut self, name: &str) -> VarId {
        if let Some(var_id) = self.vars.get_index_of(name) {
            var_id
        } else {
            self.vars.insert(name.to_owned(), Var::default());
            self.vars.len() - 1
        }
    }

    fn add_factor(&mut self, term: &fg_parser::Term) {
        let factor_id = self.factors.len();
        let vars: Vec<VarId> = term.scope().map(|v| self.add_var(v)).collect();
        for var_id in vars.iter() {
            self.vars[*var_id].factors.push(factor_id);
        }
        let head = term
            .vars
            .iter()
            .unique()
            .filter_map(|v| self.vars.get_index_of(v.as_str()))
            .collect();
        self.factors.push(Factor {
            name: term.name(),
            head,
            conditional: !term.given.is_empty(),
            vars,
            data: None,
        });
    }

    /// Attach a table to every factor, looked up by canonical factor name.
    ///
    /// All checks are done before any factor is modified: on error, the graph is unchanged.
    pub fn bind_distributions(&mut self, tables: HashMap<String, Distribution>) -> Result<()> {
        let mut nc: Vec<Option<usize>> = vec![None; self.vars.len()];
        for factor in self.factors.iter() {
            let table = tables
                .get(&factor.name)
                .ok_or_else(|| FGError::MissingFactorData(factor.name.clone()))?;
            let missing: Vec<String> = factor
                .vars
                .iter()
                .map(|v| self.var_name(*v))
                .filter(|v| !table.axes().iter().any(|a| a == v))
                .map(str::to_owned)
                .collect();
            let extra: Vec<String> = table
                .axes()
                .iter()
                .filter(|a| !factor.vars.iter().any(|v| self.var_name(*v) == a.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() || !extra.is_empty() {
                return Err(FGError::AxesMismatch {
                    factor: factor.name.clone(),
                    missing,
                    extra,
                });
            }
            for (axis, found) in table.axes().iter().zip(table.shape().iter()) {
                let var_id = self
                    .vars
                    .get_index_of(axis.as_str())
                    .ok_or_else(|| FGError::UnknownVariable(axis.clone()))?;
                match nc[var_id] {
                    None => nc[var_id] = Some(*found),
                    Some(expected) if expected != *found => {
                        return Err(FGError::InconsistentCardinality {
                            factor: factor.name.clone(),
                            var: axis.clone(),
                            found: *found,
                            expected,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        for name in tables.keys() {
            if !self.factors.iter().any(|f| &f.name == name) {
                warn!("Ignoring distribution {}: no such factor.", name);
            }
        }
        for factor in self.factors.iter_mut() {
            factor.data = tables.get(&factor.name).cloned();
        }
        for (var, nc) in self.vars.values_mut().zip(nc.into_iter()) {
            var.nc = nc;
        }
        debug!("Bound distributions to {} factors.", self.factors.len());
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Result<&Var> {
        self.vars
            .get(name)
            .ok_or_else(|| FGError::UnknownVariable(name.to_owned()))
    }
    pub fn var_id(&self, name: &str) -> Result<VarId> {
        self.vars
            .get_index_of(name)
            .ok_or_else(|| FGError::UnknownVariable(name.to_owned()))
    }
    /// First factor with that canonical name.
    pub fn factor_id(&self, name: &str) -> Result<FactorId> {
        self.factors
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| FGError::UnknownFactor(name.to_owned()))
    }
    /// Fails if `node` is not an id of this graph. Id-based accessors below panic on such ids.
    pub fn check_node(&self, node: Node) -> Result<()> {
        match node {
            Node::Var(v) if v >= self.vars.len() => Err(FGError::InvalidVarId(v)),
            Node::Factor(f) if f >= self.factors.len() => Err(FGError::InvalidFactorId(f)),
            _ => Ok(()),
        }
    }
    pub fn var(&self, var: VarId) -> &Var {
        &self.vars[var]
    }
    /// Empty for an out-of-range id.
    pub fn var_name(&self, var: VarId) -> &str {
        self.vars
            .get_index(var)
            .map(|(name, _)| name.as_str())
            .unwrap_or_default()
    }
    pub fn factor(&self, factor: FactorId) -> &Factor {
        &self.factors[factor]
    }
    /// Empty for an out-of-range id.
    pub fn factor_name(&self, factor: FactorId) -> &str {
        self.factors.get(factor).map_or("", |f| f.name.as_str())
    }
    pub fn factor_data(&self, factor: FactorId) -> Option<&Distribution> {
        self.factors[factor].data.as_ref()
    }
    pub fn cardinality(&self, var: VarId) -> Option<usize> {
        self.vars[var].nc
    }
    pub fn n_vars(&self) -> usize {
        self.vars.len()
    }
    pub fn n_factors(&self) -> usize {
        self.factors.len()
    }
    /// Variable names, in order of first appearance.
    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
    pub fn factors(&self) -> &[Factor] {
        self.factors.as_slice()
    }

    pub fn node_name(&self, node: Node) -> &str {
        match node {
            Node::Var(v) => self.var_name(v),
            Node::Factor(f) => self.factor_name(f),
        }
    }
    pub fn neighbors(&self, node: Node) -> impl Iterator<Item = Node> + '_ {
        match node {
            Node::Var(v) => Either::Left(self.vars[v].factors.iter().map(|f| Node::Factor(*f))),
            Node::Factor(f) => Either::Right(self.factors[f].vars.iter().map(|v| Node::Var(*v))),
        }
    }
    pub fn are_adjacent(&self, a: Node, b: Node) -> bool {
        match (a, b) {
            (Node::Var(v), Node::Factor(f)) | (Node::Factor(f), Node::Var(v)) => {
                self.factors.get(f).is_some_and(|f| f.vars.contains(&v))
            }
            _ => false,
        }
    }

    // Depth-first walk from every unvisited node. Since there are no parallel edges, a node that
    // is reached a second time through a different parent lies on a cycle.
    fn find_cycle(&self) -> Option<Node> {
        let mut seen_vars = vec![false; self.vars.len()];
        let mut seen_factors = vec![false; self.factors.len()];
        let starts = (0..self.vars.len())
            .map(Node::Var)
            .chain((0..self.factors.len()).map(Node::Factor));
        for start in starts {
            let mut visit_stack: Vec<(Node, Option<Node>)> = vec![(start, None)];
            while let Some((node, parent)) = visit_stack.pop() {
                let seen = match node {
                    Node::Var(v) => &mut seen_vars[v],
                    Node::Factor(f) => &mut seen_factors[f],
                };
                if *seen {
                    if parent.is_none() {
                        // Already explored from an earlier start.
                        continue;
                    }
                    return Some(node);
                }
                *seen = true;
                visit_stack.extend(
                    self.neighbors(node)
                        .filter(|n| Some(*n) != parent)
                        .map(|n| (n, Some(node))),
                );
            }
        }
        None
    }
    pub fn is_cyclic(&self) -> bool {
        self.find_cycle().is_some()
    }
    /// Fails if the graph is not a forest, exact belief propagation requires it.
    pub fn check_tree(&self) -> Result<()> {
        match self.find_cycle() {
            Some(node) => Err(FGError::Cyclic(self.node_name(node).to_owned())),
            None => Ok(()),
        }
    }

    /// Names of the bound factors whose table is not normalized: `p(a,b|c)` tables must be
    /// conditionals jointly on `a,b`, `p(a,b)` tables must be joints.
    pub fn check_conditionals(&self, tol: f64) -> Vec<String> {
        self.factors
            .iter()
            .filter(|f| {
                f.data.as_ref().is_some_and(|d| {
                    if f.conditional {
                        let head: Vec<&str> = f.head.iter().map(|v| self.var_name(*v)).collect();
                        !d.is_valid_conditional_on(&head, tol).unwrap_or(false)
                    } else {
                        !d.is_valid_joint_with_tolerance(tol)
                    }
                })
            })
            .map(|f| f.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn chain() -> FactorGraph {
        FactorGraph::from_factorization("p(h1)p(h2|h1)p(v1|h1)p(v2|h2)").unwrap()
    }

    #[test]
    fn structure() {
        let g = chain();
        assert_eq!(g.var_names().collect::<Vec<_>>(), vec!["h1", "h2", "v1", "v2"]);
        assert_eq!(g.n_factors(), 4);
        let h1 = g.var_id("h1").unwrap();
        assert_eq!(g.var(h1).factors(), &[0, 1, 2]);
        assert_eq!(g.factor_name(1), "p(h2|h1)");
        assert_eq!(g.factor(1).vars(), &[1, 0]);
        assert!(g.factor(1).is_conditional());
        assert!(!g.factor(0).is_conditional());
        assert_eq!(
            g.neighbors(Node::Factor(2)).collect::<Vec<_>>(),
            vec![Node::Var(2), Node::Var(0)]
        );
        assert!(g.are_adjacent(Node::Var(h1), Node::Factor(2)));
        assert!(!g.are_adjacent(Node::Var(h1), Node::Factor(3)));
        assert!(matches!(
            g.variable("x"),
            Err(FGError::UnknownVariable(_))
        ));
    }

    #[test]
    fn empty() {
        let g = FactorGraph::from_factorization("").unwrap();
        assert_eq!(g.n_vars(), 0);
        assert_eq!(g.n_factors(), 0);
        assert!(!g.is_cyclic());
    }

    #[test]
    fn parse_error() {
        assert!(matches!(
            FactorGraph::from_factorization("p(a)p(b|a"),
            Err(FGError::Parse(_))
        ));
    }

    #[test]
    fn out_of_range_ids() {
        let g = chain();
        assert_eq!(g.check_node(Node::Var(3)), Ok(()));
        assert_eq!(g.check_node(Node::Var(4)), Err(FGError::InvalidVarId(4)));
        assert_eq!(g.check_node(Node::Factor(9)), Err(FGError::InvalidFactorId(9)));
        assert!(!g.are_adjacent(Node::Var(0), Node::Factor(9)));
        assert_eq!(g.node_name(Node::Factor(9)), "");
    }

    #[test]
    fn cycles() {
        assert!(!chain().is_cyclic());
        let forest = FactorGraph::from_factorization("p(a)p(b|a)p(c)p(d|c)").unwrap();
        assert!(forest.check_tree().is_ok());
        let g = FactorGraph::from_factorization("p(a,b)p(b,c)p(c,a)").unwrap();
        assert!(matches!(g.check_tree(), Err(FGError::Cyclic(_))));
        // Two factors sharing two variables.
        let g = FactorGraph::from_factorization("p(a|b)p(b|a)").unwrap();
        assert!(g.is_cyclic());
    }

    #[test]
    fn conditional_checks() {
        let mut g = FactorGraph::from_factorization("p(a)p(b|a)").unwrap();
        let tables = HashMap::from([
            (
                "p(a)".to_owned(),
                Distribution::from_vector(array![0.3, 0.7], "a").unwrap(),
            ),
            (
                "p(b|a)".to_owned(),
                Distribution::new(array![[0.5, 0.2], [0.4, 0.8]].into_dyn(), ["b", "a"])
                    .unwrap(),
            ),
        ]);
        g.bind_distributions(tables).unwrap();
        assert_eq!(g.check_conditionals(1e-9), vec!["p(b|a)".to_owned()]);
        assert_eq!(g.cardinality(g.var_id("b").unwrap()), Some(2));
    }
}
