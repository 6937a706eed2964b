//! One-shot expression evaluation.
//!
//! Each evaluation builds a fresh graph and session: expressions are lowered
//! through a new [`Lowering`] context (so per-run memoization applies), the
//! requested outputs are fetched with no feeds, and the results are read
//! back as host tensors. Under live-check mode nothing touches the backend;
//! zeroed placeholders of the declared shapes come back instead.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{GraphBackend, NodeId, Output};
use crate::env::live_check_enabled;
use crate::ops::lower::Lowering;
use crate::runtime::session::Session;
use crate::tensor::dtype::{Element, HostScalar};
use crate::tensor::expr::{AnyExpr, Expr};
use crate::tensor::host_tensor::HostTensor;

fn run_nodes<B: GraphBackend>(
    backend: &Arc<B>,
    lowering: Lowering,
    nodes: &[NodeId],
) -> Result<Vec<HostTensor>> {
    let graph = lowering.into_graph();
    let session = Session::new(Arc::clone(backend), graph);
    let fetches: Vec<Output> = nodes.iter().copied().map(Output::new).collect();
    let tensors = session.run(&[], &fetches, &[])?;
    tensors
        .iter()
        .map(|t| HostTensor::from_literal(&backend.to_literal(t)?))
        .collect()
}

/// Evaluates a single expression.
pub fn eval<T: Element, B: GraphBackend>(backend: &Arc<B>, expr: &Expr<T>) -> Result<HostTensor> {
    eval_with_weights(backend, expr, HashMap::new())
}

/// Evaluates a single expression against caller-provided weight bindings.
pub fn eval_with_weights<T: Element, B: GraphBackend>(
    backend: &Arc<B>,
    expr: &Expr<T>,
    weights: HashMap<String, AnyExpr>,
) -> Result<HostTensor> {
    if live_check_enabled() {
        return Ok(HostTensor::placeholder(expr.shape(), expr.dtype()));
    }
    let mut lowering = Lowering::with_weights(weights);
    let node = lowering.lower(expr)?;
    let mut results = run_nodes(backend, lowering, &[node])?;
    Ok(results.remove(0))
}

/// Evaluates two expressions in one run, sharing lowering and execution.
pub fn eval2<T: Element, U: Element, B: GraphBackend>(
    backend: &Arc<B>,
    a: &Expr<T>,
    b: &Expr<U>,
) -> Result<(HostTensor, HostTensor)> {
    if live_check_enabled() {
        return Ok((
            HostTensor::placeholder(a.shape(), a.dtype()),
            HostTensor::placeholder(b.shape(), b.dtype()),
        ));
    }
    let mut lowering = Lowering::new();
    let na = lowering.lower(a)?;
    let nb = lowering.lower(b)?;
    let mut results = run_nodes(backend, lowering, &[na, nb])?;
    let second = results.remove(1);
    Ok((results.remove(0), second))
}

/// Evaluates three expressions in one run.
pub fn eval3<T: Element, U: Element, V: Element, B: GraphBackend>(
    backend: &Arc<B>,
    a: &Expr<T>,
    b: &Expr<U>,
    c: &Expr<V>,
) -> Result<(HostTensor, HostTensor, HostTensor)> {
    if live_check_enabled() {
        return Ok((
            HostTensor::placeholder(a.shape(), a.dtype()),
            HostTensor::placeholder(b.shape(), b.dtype()),
            HostTensor::placeholder(c.shape(), c.dtype()),
        ));
    }
    let mut lowering = Lowering::new();
    let na = lowering.lower(a)?;
    let nb = lowering.lower(b)?;
    let nc = lowering.lower(c)?;
    let mut results = run_nodes(backend, lowering, &[na, nb, nc])?;
    let third = results.remove(2);
    let second = results.remove(1);
    Ok((results.remove(0), second, third))
}

impl<T: Element> Expr<T> {
    /// Evaluates the expression and returns the raw host tensor.
    pub fn get_value<B: GraphBackend>(&self, backend: &Arc<B>) -> Result<HostTensor> {
        eval(backend, self)
    }
}

impl<T: HostScalar> Expr<T> {
    /// Evaluates a rank-0 expression to its single element.
    pub fn to_scalar<B: GraphBackend>(&self, backend: &Arc<B>) -> Result<T> {
        eval(backend, self)?.scalar()
    }

    /// Evaluates a rank-1 expression to a vector.
    pub fn to_array<B: GraphBackend>(&self, backend: &Arc<B>) -> Result<Vec<T>> {
        let value = eval(backend, self)?;
        anyhow::ensure!(
            value.rank() == 1,
            "expected a rank-1 result, got shape {:?}",
            value.dims()
        );
        value.values()
    }

    /// Evaluates a rank-2 expression to nested row-major vectors.
    pub fn to_array_2d<B: GraphBackend>(&self, backend: &Arc<B>) -> Result<Vec<Vec<T>>> {
        eval(backend, self)?.rows()
    }

    /// Evaluates a rank-3 expression to nested vectors.
    pub fn to_array_3d<B: GraphBackend>(&self, backend: &Arc<B>) -> Result<Vec<Vec<Vec<T>>>> {
        let value = eval(backend, self)?;
        anyhow::ensure!(
            value.rank() == 3,
            "expected a rank-3 result, got shape {:?}",
            value.dims()
        );
        let (d1, d2) = (value.dims()[1], value.dims()[2]);
        let flat = value.values::<T>()?;
        Ok(flat
            .chunks(d1 * d2)
            .map(|block| block.chunks(d2).map(|row| row.to_vec()).collect())
            .collect())
    }

    /// Evaluates a rank-4 expression to nested vectors.
    pub fn to_array_4d<B: GraphBackend>(
        &self,
        backend: &Arc<B>,
    ) -> Result<Vec<Vec<Vec<Vec<T>>>>> {
        let value = eval(backend, self)?;
        anyhow::ensure!(
            value.rank() == 4,
            "expected a rank-4 result, got shape {:?}",
            value.dims()
        );
        let (d1, d2, d3) = (value.dims()[1], value.dims()[2], value.dims()[3]);
        let flat = value.values::<T>()?;
        Ok(flat
            .chunks(d1 * d2 * d3)
            .map(|block| {
                block
                    .chunks(d2 * d3)
                    .map(|plane| plane.chunks(d3).map(|row| row.to_vec()).collect())
                    .collect()
            })
            .collect())
    }
}
