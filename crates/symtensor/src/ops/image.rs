//! Image decoding shape contracts.

use anyhow::Result;

use crate::backend::spec::{DecodeJpegSpec, Operation, Output};
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dim::Dim;
use crate::tensor::dtype::Utf8;
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

/// Decodes a JPEG held in a rank-0 string expression into an
/// `[height, width, channels]` image. Height and width stay inferred until
/// the backend sees the actual bytes; `channels` defaults to 3 at call sites.
pub fn decode_jpeg(bytes: &Expr<Utf8>, channels: usize) -> Result<Expr<i32>> {
    Shape::unify("decode_jpeg", bytes.shape(), &Shape::scalar())?;
    let shape = Shape::new(vec![Dim::inferred(), Dim::inferred(), Dim::known(channels)]);
    let cost = bytes.cost().saturating_add(1);
    let input = bytes.clone();
    let out_shape = shape.clone();
    Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let x = ctx.lower(&input)?;
        Ok(ctx.graph().add(
            Operation::DecodeJpeg(DecodeJpegSpec { channels }),
            vec![Output::new(x)],
            spec_of(&out_shape, crate::tensor::DType::I32),
        ))
    }))
}
