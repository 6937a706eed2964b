//! 2D convolution, forward and input-gradient.
//!
//! Activations are NHWC; filters are `[F1, F2, C_in, C_out]`. Output spatial
//! extents are expressed with the stride algebra (`Div` for the forward pass,
//! `Mul` for the input gradient) so partially known sizes propagate without
//! naming intermediates.

use anyhow::Result;

use crate::backend::spec::{Conv2dSpec, Operation, Output, Padding};
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dim::Dim;
use crate::tensor::dtype::FloatElement;
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

impl<T: FloatElement> Expr<T> {
    /// Convolves `[N, H, W, C]` with a `[F1, F2, C, C']` filter, producing
    /// `[N, H/s, W/s, C']` (ceiling division, matching `SAME` padding).
    /// Defaults elsewhere in the surface: stride 1, `SAME` padding.
    pub fn conv2d(
        &self,
        filter: &Expr<T>,
        stride: usize,
        padding: Padding,
    ) -> Result<Expr<T>> {
        let batch = Dim::inferred();
        let height = Dim::inferred();
        let width = Dim::inferred();
        let in_channels = Dim::inferred();
        let f1 = Dim::inferred();
        let f2 = Dim::inferred();
        let out_channels = Dim::inferred();
        Shape::unify(
            "conv2d",
            self.shape(),
            &Shape::new(vec![
                batch.clone(),
                height.clone(),
                width.clone(),
                in_channels.clone(),
            ]),
        )?;
        Shape::unify(
            "conv2d",
            filter.shape(),
            &Shape::new(vec![f1, f2, in_channels, out_channels.clone()]),
        )?;

        let shape = Shape::new(vec![
            batch,
            height.div_ceil(stride),
            width.div_ceil(stride),
            out_channels,
        ]);
        let cost = self.cost().saturating_add(filter.cost()).saturating_add(1);
        let spec = Conv2dSpec {
            strides: [stride, stride],
            padding,
        };
        let input = self.clone();
        let filter = filter.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            let w = ctx.lower(&filter)?;
            Ok(ctx.graph().add(
                Operation::Conv2d(spec),
                vec![Output::new(x), Output::new(w)],
                spec_of(&out_shape, input.dtype()),
            ))
        }))
    }
}

/// Gradient of [`Expr::conv2d`] with respect to its input: given the filter
/// `[F1, F2, C_in, C_out]` and `out_backprop` `[N, H, W, C_out]`, produces
/// `[N, H*s, W*s, C_in]`.
pub fn conv2d_backprop_input<T: FloatElement>(
    filter: &Expr<T>,
    out_backprop: &Expr<T>,
    stride: usize,
    padding: Padding,
) -> Result<Expr<T>> {
    let f1 = Dim::inferred();
    let f2 = Dim::inferred();
    let in_channels = Dim::inferred();
    let out_channels = Dim::inferred();
    let batch = Dim::inferred();
    let height = Dim::inferred();
    let width = Dim::inferred();
    Shape::unify(
        "conv2d_backprop_input",
        filter.shape(),
        &Shape::new(vec![f1, f2, in_channels.clone(), out_channels.clone()]),
    )?;
    Shape::unify(
        "conv2d_backprop_input",
        out_backprop.shape(),
        &Shape::new(vec![batch.clone(), height.clone(), width.clone(), out_channels]),
    )?;

    let shape = Shape::new(vec![
        batch,
        height.times(stride),
        width.times(stride),
        in_channels,
    ]);
    let cost = filter
        .cost()
        .saturating_add(out_backprop.cost())
        .saturating_add(1);
    let spec = Conv2dSpec {
        strides: [stride, stride],
        padding,
    };
    let filter = filter.clone();
    let out_backprop = out_backprop.clone();
    let out_shape = shape.clone();
    Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let w = ctx.lower(&filter)?;
        let g = ctx.lower(&out_backprop)?;
        Ok(ctx.graph().add(
            Operation::Conv2dBackpropInput(spec),
            vec![Output::new(w), Output::new(g)],
            spec_of(&out_shape, filter.dtype()),
        ))
    }))
}
