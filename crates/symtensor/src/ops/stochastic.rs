//! Random tensor constructors.

use crate::backend::spec::{Operation, RngTruncatedNormalSpec};
use crate::error::Error;
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dtype::FloatElement;
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

/// Samples from a standard normal truncated at two standard deviations.
///
/// The shape must be fully constructible when the expression is lowered;
/// open dimensions are rejected at run time, not at construction.
pub fn truncated_normal<T: FloatElement>(shape: Shape) -> Expr<T> {
    truncated_normal_seeded(shape, None)
}

/// [`truncated_normal`] with an explicit seed for reproducible runs.
pub fn truncated_normal_seeded<T: FloatElement>(shape: Shape, seed: Option<u64>) -> Expr<T> {
    let out_shape = shape.clone();
    Expr::from_build(shape, 1, move |ctx: &mut Lowering| {
        let spec = spec_of(&out_shape, T::DTYPE);
        if spec.static_dims().is_none() {
            return Err(Error::bad_argument(
                "truncated_normal",
                format!("shape {out_shape} is not constructible at run time"),
            )
            .into());
        }
        Ok(ctx.graph().add(
            Operation::RngTruncatedNormal(RngTruncatedNormalSpec { seed }),
            Vec::new(),
            spec,
        ))
    })
}
