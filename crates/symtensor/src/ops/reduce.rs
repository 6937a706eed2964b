//! Reductions over expression axes.
//!
//! Defaults follow the operator contract: `axes = None` reduces every
//! dimension, `keep_dims = false` drops the reduced axes (with `keep_dims`
//! the reduced axes survive with extent one).

use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{BinaryOp, Operation, Output, ReduceKind, ReduceSpec};
use crate::error::Error;
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dtype::{FloatElement, NumericElement};
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

fn reduce_shape(
    op: &str,
    input: &Shape,
    axes: Option<&[usize]>,
    keep_dims: bool,
) -> Result<Shape, Error> {
    match axes {
        None => {
            if !keep_dims {
                return Ok(Shape::scalar());
            }
            let (dims, flex) = input.realize();
            if flex.is_some() {
                return Err(Error::bad_argument(
                    op,
                    "keep_dims over all axes requires a shape of known rank",
                ));
            }
            Ok(Shape::new(
                dims.iter().map(|_| crate::tensor::Dim::known(1)).collect(),
            ))
        }
        Some(axes) => {
            let min = axes.iter().max().map(|&a| a + 1).unwrap_or(0);
            Shape::min_rank(op, input, min)?;
            let (dims, flex) = input.realize();
            let kept = dims
                .iter()
                .enumerate()
                .filter_map(|(i, d)| {
                    if axes.contains(&i) {
                        if keep_dims {
                            Some(crate::tensor::Dim::known(1))
                        } else {
                            None
                        }
                    } else {
                        Some(d.clone())
                    }
                })
                .collect();
            Ok(Shape::from_parts(kept, flex))
        }
    }
}

fn reduce<T: NumericElement>(
    op: &str,
    kind: ReduceKind,
    input: &Expr<T>,
    axes: Option<&[usize]>,
    keep_dims: bool,
) -> Result<Expr<T>> {
    let shape = reduce_shape(op, input.shape(), axes, keep_dims)?;
    let cost = input.cost().saturating_add(1);
    let spec = ReduceSpec {
        kind,
        axes: axes.map(|a| a.to_vec()),
        keep_dims,
    };
    let input = input.clone();
    let out_shape = shape.clone();
    Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let x = ctx.lower(&input)?;
        Ok(ctx.graph().add(
            Operation::Reduce(spec.clone()),
            vec![Output::new(x)],
            spec_of(&out_shape, input.dtype()),
        ))
    }))
}

impl<T: NumericElement> Expr<T> {
    /// Sum over every element, yielding a scalar.
    pub fn sum(&self) -> Expr<T> {
        reduce("sum", ReduceKind::Sum, self, None, false)
            .expect("reducing all axes cannot fail")
    }

    pub fn reduce_sum(&self, axes: Option<&[usize]>, keep_dims: bool) -> Result<Expr<T>> {
        reduce("sum", ReduceKind::Sum, self, axes, keep_dims)
    }

    pub fn reduce_prod(&self, axes: Option<&[usize]>, keep_dims: bool) -> Result<Expr<T>> {
        reduce("prod", ReduceKind::Prod, self, axes, keep_dims)
    }

    pub fn reduce_max(&self, axes: Option<&[usize]>, keep_dims: bool) -> Result<Expr<T>> {
        reduce("max", ReduceKind::Max, self, axes, keep_dims)
    }

    pub fn reduce_min(&self, axes: Option<&[usize]>, keep_dims: bool) -> Result<Expr<T>> {
        reduce("min", ReduceKind::Min, self, axes, keep_dims)
    }
}

impl<T: FloatElement> Expr<T> {
    /// Mean over every element, yielding a scalar.
    pub fn mean(&self) -> Expr<T> {
        reduce("mean", ReduceKind::Mean, self, None, false)
            .expect("reducing all axes cannot fail")
    }

    pub fn reduce_mean(&self, axes: Option<&[usize]>, keep_dims: bool) -> Result<Expr<T>> {
        reduce("mean", ReduceKind::Mean, self, axes, keep_dims)
    }

    /// Mean and variance over the given axes, computed as a paired lowering:
    /// however many consumers materialize either half, the pair is lowered
    /// once per run.
    pub fn moments(
        &self,
        axes: Option<&[usize]>,
        keep_dims: bool,
    ) -> Result<(Expr<T>, Expr<T>)> {
        let out_shape = reduce_shape("moments", self.shape(), axes, keep_dims)?;
        let keep_shape = reduce_shape("moments", self.shape(), axes, true)?;
        let cost = self.cost().saturating_add(1);
        let axes: Option<Vec<usize>> = axes.map(|a| a.to_vec());
        let anchor = Arc::new(());

        let lower_pair = {
            let input = self.clone();
            let out_shape = out_shape.clone();
            let keep_shape = keep_shape.clone();
            let anchor = Arc::clone(&anchor);
            move |ctx: &mut Lowering| -> Result<(
                crate::backend::spec::NodeId,
                crate::backend::spec::NodeId,
            )> {
                let key = Arc::as_ptr(&anchor) as usize;
                if let Some(pair) = ctx.moments_cached(key) {
                    return Ok(pair);
                }
                let x = ctx.lower(&input)?;
                let out_spec = spec_of(&out_shape, input.dtype());
                let keep_spec = ReduceSpec {
                    kind: ReduceKind::Mean,
                    axes: axes.clone(),
                    keep_dims: true,
                };
                let graph = ctx.graph();
                let mean_keep = graph.add(
                    Operation::Reduce(keep_spec),
                    vec![Output::new(x)],
                    spec_of(&keep_shape, input.dtype()),
                );
                let centered = graph.add(
                    Operation::Binary(BinaryOp::Sub),
                    vec![Output::new(x), Output::new(mean_keep)],
                    spec_of(input.shape(), input.dtype()),
                );
                let squared = graph.add(
                    Operation::Binary(BinaryOp::Mul),
                    vec![Output::new(centered), Output::new(centered)],
                    spec_of(input.shape(), input.dtype()),
                );
                let requested = ReduceSpec {
                    kind: ReduceKind::Mean,
                    axes: axes.clone(),
                    keep_dims,
                };
                let mean = if keep_dims {
                    mean_keep
                } else {
                    graph.add(
                        Operation::Reduce(requested.clone()),
                        vec![Output::new(x)],
                        out_spec.clone(),
                    )
                };
                let variance = graph.add(
                    Operation::Reduce(requested),
                    vec![Output::new(squared)],
                    out_spec,
                );
                ctx.insert_moments(key, (mean, variance));
                Ok((mean, variance))
            }
        };

        let lower_mean = lower_pair.clone();
        let mean = Expr::from_build(out_shape.clone(), cost, move |ctx: &mut Lowering| {
            Ok(lower_mean(ctx)?.0)
        });
        let variance = Expr::from_build(out_shape, cost, move |ctx: &mut Lowering| {
            Ok(lower_pair(ctx)?.1)
        });
        Ok((mean, variance))
    }
}
