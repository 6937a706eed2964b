//! Symbolic differentiation over expressions.
//!
//! `gradients` is the façade: it validates the scalar contract, then defers
//! to the graph-level gradient construction at materialization time,
//! memoized per run on the structural triple `(y, xs, dy?)`. The
//! higher-order family is built from repeated gradient construction plus
//! stacking.

use anyhow::Result;

use crate::backend::autodiff;
use crate::error::Error;
use crate::ops::lower::{GradKey, Lowering};
use crate::ops::shape_ops::SliceIndex;
use crate::tensor::dim::Dim;
use crate::tensor::dtype::FloatElement;
use crate::tensor::expr::{Expr, COST_OPAQUE};
use crate::tensor::shape::Shape;

/// Builds `d y / d x_i` for each target, where `y` must unify with the
/// scalar shape. Every returned expression has the shape of its target.
pub fn gradients<T: FloatElement>(y: &Expr<T>, xs: &[Expr<T>]) -> Result<Vec<Expr<T>>> {
    gradients_with(y, xs, None)
}

/// [`gradients`] with an explicit incoming gradient for `y`.
pub fn gradients_with<T: FloatElement>(
    y: &Expr<T>,
    xs: &[Expr<T>],
    dy: Option<&Expr<T>>,
) -> Result<Vec<Expr<T>>> {
    Shape::unify("gradients", y.shape(), &Shape::scalar())?;

    let key_xs: Vec<_> = xs.iter().map(Expr::id).collect();
    let mut results = Vec::with_capacity(xs.len());
    for (index, x) in xs.iter().enumerate() {
        let shape = x.shape().clone();
        let y = y.clone();
        let xs = xs.to_vec();
        let dy = dy.cloned();
        let key_xs = key_xs.clone();
        results.push(Expr::from_build(
            shape,
            COST_OPAQUE,
            move |ctx: &mut Lowering| {
                let key = GradKey {
                    y: y.id(),
                    xs: key_xs.clone(),
                    dy: dy.as_ref().map(Expr::id),
                };
                if ctx.grads_cached(&key).is_none() {
                    let y_node = ctx.lower(&y)?;
                    let mut x_nodes = Vec::with_capacity(xs.len());
                    for x in &xs {
                        x_nodes.push(ctx.lower(x)?);
                    }
                    let dy_node = match &dy {
                        Some(dy) => Some(ctx.lower(dy)?),
                        None => None,
                    };
                    let grad_nodes =
                        autodiff::add_gradients(ctx.graph(), y_node, &x_nodes, dy_node)?;
                    ctx.insert_grads(key.clone(), grad_nodes);
                }
                let nodes = ctx.grads_cached(&key).expect("gradient nodes just inserted");
                Ok(nodes[index])
            },
        ));
    }
    Ok(results)
}

/// `d y / d x` for a single target.
pub fn grad<T: FloatElement>(y: &Expr<T>, x: &Expr<T>) -> Result<Expr<T>> {
    let mut grads = gradients(y, std::slice::from_ref(x))?;
    Ok(grads.remove(0))
}

/// First derivative of a scalar function at `x`.
pub fn diff<T: FloatElement>(f: impl Fn(&Expr<T>) -> Expr<T>, x: &Expr<T>) -> Result<Expr<T>> {
    let y = f(x);
    grad(&y, x)
}

/// `n`-th derivative of a scalar function at `x`.
pub fn diff_n<T: FloatElement>(
    n: usize,
    f: impl Fn(&Expr<T>) -> Expr<T>,
    x: &Expr<T>,
) -> Result<Expr<T>> {
    let mut current = f(x);
    for _ in 0..n {
        current = grad(&current, x)?;
    }
    Ok(current)
}

fn known_vector_len<T: FloatElement>(op: &str, e: &Expr<T>) -> Result<usize> {
    Shape::unify(op, e.shape(), &Shape::new(vec![Dim::inferred()]))?;
    e.shape()
        .dims()
        .first()
        .and_then(Dim::value)
        .ok_or_else(|| Error::bad_argument(op, "vector length must be known").into())
}

/// Jacobian of a vector-valued function: row `i` is the gradient of the
/// `i`-th output component, stacked into `[m, n]`.
pub fn jacobian<T: FloatElement>(
    f: impl Fn(&Expr<T>) -> Expr<T>,
    x: &Expr<T>,
) -> Result<Expr<T>> {
    let y = f(x);
    let m = known_vector_len("jacobian", &y)?;
    let mut rows = Vec::with_capacity(m);
    for i in 0..m {
        let component = y.slice(&[SliceIndex::Single(i as i64)])?;
        rows.push(grad(&component, x)?);
    }
    crate::ops::shape_ops::stack(&rows, 0)
}

/// Hessian of a scalar function: the Jacobian of its gradient.
pub fn hessian<T: FloatElement>(
    f: impl Fn(&Expr<T>) -> Expr<T>,
    x: &Expr<T>,
) -> Result<Expr<T>> {
    let y = f(x);
    let gradient = grad(&y, x)?;
    let n = known_vector_len("hessian", &gradient)?;
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let component = gradient.slice(&[SliceIndex::Single(i as i64)])?;
        rows.push(grad(&component, x)?);
    }
    crate::ops::shape_ops::stack(&rows, 0)
}

/// Trace of the Hessian.
pub fn laplacian<T: FloatElement>(
    f: impl Fn(&Expr<T>) -> Expr<T>,
    x: &Expr<T>,
) -> Result<Expr<T>> {
    let h = hessian(f, x)?;
    Ok(h.diag_part()?.sum())
}

/// Trace of the Jacobian of a vector field.
pub fn divergence<T: FloatElement>(
    f: impl Fn(&Expr<T>) -> Expr<T>,
    x: &Expr<T>,
) -> Result<Expr<T>> {
    let j = jacobian(f, x)?;
    Ok(j.diag_part()?.sum())
}

/// Curl of a three-dimensional vector field.
pub fn curl<T: FloatElement>(f: impl Fn(&Expr<T>) -> Expr<T>, x: &Expr<T>) -> Result<Expr<T>> {
    Shape::unify("curl", x.shape(), &Shape::known(&[3]))?;
    let j = jacobian(&f, x)?;
    Shape::unify("curl", j.shape(), &Shape::known(&[3, 3]))?;
    let entry = |row: i64, col: i64| -> Result<Expr<T>> {
        j.slice(&[SliceIndex::Single(row), SliceIndex::Single(col)])
    };
    let cx = entry(2, 1)?.try_sub(&entry(1, 2)?)?;
    let cy = entry(0, 2)?.try_sub(&entry(2, 0)?)?;
    let cz = entry(1, 0)?.try_sub(&entry(0, 1)?)?;
    crate::ops::shape_ops::stack(&[cx, cy, cz], 0)
}
