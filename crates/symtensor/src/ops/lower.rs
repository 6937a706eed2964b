//! Per-run materialization context.
//!
//! A [`Lowering`] lives for the duration of a single run. It owns the backend
//! graph under construction and the memoization tables that guarantee each
//! expression is lowered at most once per run. Nothing here survives across
//! runs.

use std::collections::HashMap;

use anyhow::Result;

use crate::backend::graph::Graph;
use crate::backend::spec::{Dimension, NodeId, TensorSpec};
use crate::tensor::dtype::DType;
use crate::tensor::expr::{AnyExpr, Expr, ExprId};
use crate::tensor::shape::Shape;
use crate::tensor::Element;

/// Structural key for gradient subgraph memoization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GradKey {
    pub y: ExprId,
    pub xs: Vec<ExprId>,
    pub dy: Option<ExprId>,
}

/// Materialization context for one run.
pub struct Lowering {
    graph: Graph,
    nodes: HashMap<ExprId, NodeId>,
    moment_nodes: HashMap<usize, (NodeId, NodeId)>,
    grad_nodes: HashMap<GradKey, Vec<NodeId>>,
    weights: HashMap<String, AnyExpr>,
}

impl Lowering {
    pub fn new() -> Self {
        Lowering::with_weights(HashMap::new())
    }

    /// A context with caller-provided variable bindings, consulted by
    /// `variable` nodes during lowering.
    pub fn with_weights(weights: HashMap<String, AnyExpr>) -> Self {
        Lowering {
            graph: Graph::new(),
            nodes: HashMap::new(),
            moment_nodes: HashMap::new(),
            grad_nodes: HashMap::new(),
            weights,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Lowers an expression, memoized by identity: however many parents ask,
    /// the expression contributes exactly one backend node per run.
    pub fn lower<T: Element>(&mut self, expr: &Expr<T>) -> Result<NodeId> {
        self.lower_erased(&expr.erase())
    }

    pub fn lower_erased(&mut self, expr: &AnyExpr) -> Result<NodeId> {
        if let Some(node) = self.nodes.get(&expr.id()) {
            return Ok(*node);
        }
        let node = expr.build(self)?;
        self.nodes.insert(expr.id(), node);
        Ok(node)
    }

    pub(crate) fn weight(&self, name: &str) -> Option<AnyExpr> {
        self.weights.get(name).cloned()
    }

    pub(crate) fn moments_cached(&self, key: usize) -> Option<(NodeId, NodeId)> {
        self.moment_nodes.get(&key).copied()
    }

    pub(crate) fn insert_moments(&mut self, key: usize, nodes: (NodeId, NodeId)) {
        self.moment_nodes.insert(key, nodes);
    }

    pub(crate) fn grads_cached(&self, key: &GradKey) -> Option<Vec<NodeId>> {
        self.grad_nodes.get(key).cloned()
    }

    pub(crate) fn insert_grads(&mut self, key: GradKey, nodes: Vec<NodeId>) {
        self.grad_nodes.insert(key, nodes);
    }
}

impl Default for Lowering {
    fn default() -> Self {
        Lowering::new()
    }
}

/// Projects a symbolic shape onto the backend shape vocabulary: resolved
/// dimensions become static, open ones dynamic, and an unsolved flex tail
/// contributes nothing.
pub(crate) fn spec_of(shape: &Shape, dtype: DType) -> TensorSpec {
    let dims = shape
        .dims()
        .iter()
        .map(|d| match d.value() {
            Some(n) => Dimension::Static(n),
            None => Dimension::Dynamic,
        })
        .collect();
    TensorSpec::new(dtype, dims)
}
