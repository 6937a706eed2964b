//! Shape-changing operators: reshape, broadcast, stacking, expansion,
//! squeezing, and slicing.

use anyhow::Result;

use crate::backend::spec::{
    ExpandDimsSpec, Operation, Output, PackSpec, SliceSpec, SqueezeSpec,
};
use crate::error::Error;
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dim::Dim;
use crate::tensor::dtype::{Element, NumericElement};
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

/// One axis of a slice request.
///
/// `Single` selects one index and squeezes the axis away. `Range` keeps the
/// axis; an `end` of `-1` means "to the end of the axis", which produces an
/// inferred output extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceIndex {
    Single(i64),
    Range { start: i64, end: i64 },
}

impl<T: Element> Expr<T> {
    /// Reinterprets the expression with a caller-supplied shape. No algebraic
    /// relationship with the input shape is enforced beyond the element-count
    /// check backends perform at run time.
    pub fn reshape(&self, shape: Shape) -> Expr<T> {
        let cost = self.cost().saturating_add(1);
        let input = self.clone();
        let out_shape = shape.clone();
        Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            Ok(ctx.graph().add(
                Operation::Reshape,
                vec![Output::new(x)],
                spec_of(&out_shape, input.dtype()),
            ))
        })
    }

    /// Broadcasts the expression to a caller-supplied shape.
    pub fn broadcast_to(&self, shape: Shape) -> Expr<T> {
        let cost = self.cost().saturating_add(1);
        let input = self.clone();
        let out_shape = shape.clone();
        Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            Ok(ctx.graph().add(
                Operation::BroadcastTo,
                vec![Output::new(x)],
                spec_of(&out_shape, input.dtype()),
            ))
        })
    }

    /// Inserts a fresh inferred dimension at `dim` (default position zero in
    /// the original surface). Downstream broadcasting solves the new extent.
    pub fn expand_dims(&self, dim: usize) -> Result<Expr<T>> {
        Shape::min_rank("expand_dims", self.shape(), dim)?;
        let (dims, flex) = self.shape().realize();
        let mut out_dims = dims;
        out_dims.insert(dim, Dim::inferred());
        let shape = Shape::from_parts(out_dims, flex);

        let cost = self.cost().saturating_add(1);
        let input = self.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            Ok(ctx.graph().add(
                Operation::ExpandDims(ExpandDimsSpec { axis: dim }),
                vec![Output::new(x)],
                spec_of(&out_shape, input.dtype()),
            ))
        }))
    }

    /// Removes the listed axes, unifying each with extent one.
    pub fn squeeze(&self, axes: &[usize]) -> Result<Expr<T>> {
        let min = axes.iter().max().map(|&a| a + 1).unwrap_or(0);
        Shape::min_rank("squeeze", self.shape(), min)?;
        let (dims, flex) = self.shape().realize();
        for &axis in axes {
            Dim::unify("squeeze", &dims[axis], &Dim::known(1))?;
        }
        let kept = dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, d)| d.clone())
            .collect();
        let shape = Shape::from_parts(kept, flex);

        let cost = self.cost().saturating_add(1);
        let spec = SqueezeSpec {
            axes: axes.to_vec(),
        };
        let input = self.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            Ok(ctx.graph().add(
                Operation::Squeeze(spec.clone()),
                vec![Output::new(x)],
                spec_of(&out_shape, input.dtype()),
            ))
        }))
    }

    /// Slices leading axes. Axes beyond the request pass through untouched;
    /// `Single` entries reduce the rank by squeezing their axis.
    pub fn slice(&self, indices: &[SliceIndex]) -> Result<Expr<T>> {
        Shape::min_rank("slice", self.shape(), indices.len())?;
        let (dims, flex) = self.shape().realize();

        let mut starts = Vec::with_capacity(indices.len());
        let mut sizes = Vec::with_capacity(indices.len());
        let mut squeezed = Vec::new();
        let mut out_dims = Vec::new();
        for (axis, index) in indices.iter().enumerate() {
            match *index {
                SliceIndex::Single(i) => {
                    if i < 0 {
                        return Err(Error::bad_argument(
                            "slice",
                            format!("negative index {i} on axis {axis}"),
                        )
                        .into());
                    }
                    starts.push(i as usize);
                    sizes.push(1);
                    squeezed.push(axis);
                }
                SliceIndex::Range { start, end } => {
                    if start < 0 {
                        return Err(Error::bad_argument(
                            "slice",
                            format!("negative start {start} on axis {axis}"),
                        )
                        .into());
                    }
                    starts.push(start as usize);
                    if end == -1 {
                        sizes.push(-1);
                        out_dims.push(Dim::inferred());
                    } else {
                        if end < start {
                            return Err(Error::bad_argument(
                                "slice",
                                format!("empty or reversed range {start}..{end} on axis {axis}"),
                            )
                            .into());
                        }
                        let len = (end - start) as usize;
                        sizes.push(len as i64);
                        out_dims.push(Dim::known(len));
                    }
                }
            }
        }
        out_dims.extend(dims[indices.len()..].iter().cloned());
        let shape = Shape::from_parts(out_dims, flex);

        let cost = self.cost().saturating_add(1);
        let slice_spec = SliceSpec { starts, sizes };
        let input = self.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            let graph = ctx.graph();
            let dtype = input.dtype();
            let out_spec = spec_of(&out_shape, dtype);
            // The intermediate slice keeps singleton axes; splice them back
            // into the squeezed output spec.
            let sliced_rank = out_spec.dims.len() + squeezed.len();
            let mut out_iter = out_spec.dims.iter();
            let mut sliced_dims = Vec::with_capacity(sliced_rank);
            for axis in 0..sliced_rank {
                if squeezed.contains(&axis) {
                    sliced_dims.push(crate::backend::spec::Dimension::Static(1));
                } else if let Some(dim) = out_iter.next() {
                    sliced_dims.push(*dim);
                }
            }
            let sliced = graph.add(
                Operation::Slice(slice_spec.clone()),
                vec![Output::new(x)],
                crate::backend::spec::TensorSpec::new(dtype, sliced_dims),
            );
            if squeezed.is_empty() {
                Ok(sliced)
            } else {
                Ok(graph.add(
                    Operation::Squeeze(SqueezeSpec {
                        axes: squeezed.clone(),
                    }),
                    vec![Output::new(sliced)],
                    out_spec,
                ))
            }
        }))
    }
}

/// Stacks expressions of a common shape along a new axis.
pub fn stack<T: NumericElement>(exprs: &[Expr<T>], axis: usize) -> Result<Expr<T>> {
    let first = exprs
        .first()
        .ok_or_else(|| Error::bad_argument("stack", "requires at least one expression"))?;
    for other in &exprs[1..] {
        Shape::unify("stack", first.shape(), other.shape())?;
    }
    Shape::min_rank("stack", first.shape(), axis)?;
    let (dims, flex) = first.shape().realize();
    let mut out_dims = dims;
    out_dims.insert(axis, Dim::known(exprs.len()));
    let shape = Shape::from_parts(out_dims, flex);

    let cost = exprs
        .iter()
        .fold(0u32, |acc, e| acc.saturating_add(e.cost()))
        .saturating_add(1);
    let inputs: Vec<Expr<T>> = exprs.to_vec();
    let out_shape = shape.clone();
    Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let mut lowered = Vec::with_capacity(inputs.len());
        for input in &inputs {
            lowered.push(Output::new(ctx.lower(input)?));
        }
        Ok(ctx.graph().add(
            Operation::Pack(PackSpec { axis }),
            lowered,
            spec_of(&out_shape, inputs[0].dtype()),
        ))
    }))
}
