//! Sugared expression constructors and the `variable` binding node.

use anyhow::Result;

use crate::error::Error;
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dtype::{Element, HostScalar, NumericElement, Utf8};
use crate::tensor::expr::{Expr, COST_OPAQUE};
use crate::tensor::host_tensor::HostTensor;
use crate::tensor::shape::Shape;

fn literal_expr<T: HostScalar>(dims: Vec<usize>, values: Vec<T>) -> Expr<T> {
    let shape = Shape::known(&dims);
    Expr::from_literal(shape, move || {
        HostTensor::from_values(dims.clone(), &values)
            .expect("literal constructors validate their payload")
    })
}

/// A rank-0 constant.
pub fn scalar<T: HostScalar>(value: T) -> Expr<T> {
    literal_expr(Vec::new(), vec![value])
}

/// A rank-0 constant that broadcasts to any rank: its shape carries a flex
/// tail that unification may expand.
pub fn broadcast_scalar<T: HostScalar>(value: T) -> Expr<T> {
    let shape = Shape::broadcastable_scalar();
    Expr::from_literal(shape, move || {
        HostTensor::from_values(Vec::new(), &[value])
            .expect("literal constructors validate their payload")
    })
}

/// A rank-1 constant.
pub fn vector<T: HostScalar>(values: &[T]) -> Expr<T> {
    literal_expr(vec![values.len()], values.to_vec())
}

/// A rank-2 constant from rows. Jagged input is rejected.
pub fn matrix<T: HostScalar, R: AsRef<[T]>>(rows: &[R]) -> Result<Expr<T>> {
    let height = rows.len();
    let width = rows.first().map(|row| row.as_ref().len()).unwrap_or(0);
    let mut values = Vec::with_capacity(height * width);
    for row in rows {
        let row = row.as_ref();
        if row.len() != width {
            return Err(Error::bad_argument(
                "matrix",
                format!("jagged input: row length {} != {}", row.len(), width),
            )
            .into());
        }
        values.extend_from_slice(row);
    }
    Ok(literal_expr(vec![height, width], values))
}

/// A rank-3 constant from nested slices. Jagged input is rejected.
pub fn tensor3<T, R, P>(planes: &[P]) -> Result<Expr<T>>
where
    T: HostScalar,
    R: AsRef<[T]>,
    P: AsRef<[R]>,
{
    let d0 = planes.len();
    let d1 = planes.first().map(|p| p.as_ref().len()).unwrap_or(0);
    let d2 = planes
        .first()
        .and_then(|p| p.as_ref().first())
        .map(|r| r.as_ref().len())
        .unwrap_or(0);
    let mut values = Vec::with_capacity(d0 * d1 * d2);
    for plane in planes {
        let plane = plane.as_ref();
        if plane.len() != d1 {
            return Err(Error::bad_argument("tensor3", "jagged input").into());
        }
        for row in plane {
            let row = row.as_ref();
            if row.len() != d2 {
                return Err(Error::bad_argument("tensor3", "jagged input").into());
            }
            values.extend_from_slice(row);
        }
    }
    Ok(literal_expr(vec![d0, d1, d2], values))
}

/// A rank-4 constant from nested slices. Jagged input is rejected.
pub fn tensor4<T, R, P, V>(blocks: &[V]) -> Result<Expr<T>>
where
    T: HostScalar,
    R: AsRef<[T]>,
    P: AsRef<[R]>,
    V: AsRef<[P]>,
{
    let d0 = blocks.len();
    let d1 = blocks.first().map(|b| b.as_ref().len()).unwrap_or(0);
    let d2 = blocks
        .first()
        .and_then(|b| b.as_ref().first())
        .map(|p| p.as_ref().len())
        .unwrap_or(0);
    let d3 = blocks
        .first()
        .and_then(|b| b.as_ref().first())
        .and_then(|p| p.as_ref().first())
        .map(|r| r.as_ref().len())
        .unwrap_or(0);
    let mut values = Vec::with_capacity(d0 * d1 * d2 * d3);
    for block in blocks {
        let block = block.as_ref();
        if block.len() != d1 {
            return Err(Error::bad_argument("tensor4", "jagged input").into());
        }
        for plane in block {
            let plane = plane.as_ref();
            if plane.len() != d2 {
                return Err(Error::bad_argument("tensor4", "jagged input").into());
            }
            for row in plane {
                let row = row.as_ref();
                if row.len() != d3 {
                    return Err(Error::bad_argument("tensor4", "jagged input").into());
                }
                values.extend_from_slice(row);
            }
        }
    }
    Ok(literal_expr(vec![d0, d1, d2, d3], values))
}

/// An RGB pixel as a `[3]` constant.
pub fn pixel<T: HostScalar>(rgb: [T; 3]) -> Expr<T> {
    vector(&rgb)
}

/// An `[H, W, C]` image constant.
pub fn image<T, R, P>(rows: &[P]) -> Result<Expr<T>>
where
    T: HostScalar,
    R: AsRef<[T]>,
    P: AsRef<[R]>,
{
    tensor3(rows)
}

/// A `[T, H, W, C]` video constant.
pub fn video<T, R, P, V>(frames: &[V]) -> Result<Expr<T>>
where
    T: HostScalar,
    R: AsRef<[T]>,
    P: AsRef<[R]>,
    V: AsRef<[P]>,
{
    tensor4(frames)
}

/// Stacks expressions along a fresh leading batch axis.
pub fn batch<T: NumericElement>(items: &[Expr<T>]) -> Result<Expr<T>> {
    crate::ops::shape_ops::stack(items, 0)
}

/// A rank-0 string constant holding raw bytes (e.g. an encoded JPEG).
pub fn bytes(payload: Vec<u8>) -> Expr<Utf8> {
    Expr::from_literal(Shape::scalar(), move || {
        HostTensor::from_bytes(payload.clone())
    })
}

/// A feedable placeholder of the given symbolic shape.
pub fn placeholder<T: Element>(shape: Shape) -> Expr<T> {
    let out_shape = shape.clone();
    Expr::from_build(shape, 1, move |ctx: &mut Lowering| {
        Ok(ctx.graph().add(
            crate::backend::spec::Operation::Placeholder,
            Vec::new(),
            spec_of(&out_shape, T::DTYPE),
        ))
    })
}

/// A named variable with a default initializer.
///
/// At build time the node consults the run's weight map: a binding with the
/// same element type is lowered in place of the default; anything else falls
/// back to the default with a diagnostic on stderr.
pub fn variable<T: Element>(init: &Expr<T>, name: &str) -> Expr<T> {
    let shape = init.shape().clone();
    let init = init.clone();
    let name = name.to_string();
    Expr::from_build(shape, COST_OPAQUE, move |ctx: &mut Lowering| {
        match ctx.weight(&name) {
            Some(weight) if weight.dtype() == T::DTYPE => ctx.lower_erased(&weight),
            Some(weight) => {
                eprintln!(
                    "variable '{name}': bound weight has dtype {:?}, expected {:?}; using the default initializer",
                    weight.dtype(),
                    T::DTYPE
                );
                ctx.lower(&init)
            }
            None => {
                eprintln!("variable '{name}': no weight bound; using the default initializer");
                ctx.lower(&init)
            }
        }
    })
}
