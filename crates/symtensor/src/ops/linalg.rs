//! Linear algebra operators.

use anyhow::Result;

use crate::backend::spec::{MatMulSpec, Operation, Output};
use crate::error::Error;
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::dim::Dim;
use crate::tensor::dtype::NumericElement;
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

impl<T: NumericElement> Expr<T> {
    /// Matrix product `[n1, m] x [m, n2] -> [n1, n2]`. The inner dimension
    /// is unified strictly (no broadcasting).
    pub fn matmul(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        let rows = Dim::inferred();
        let inner = Dim::inferred();
        let cols = Dim::inferred();
        Shape::unify(
            "matmul",
            self.shape(),
            &Shape::new(vec![rows.clone(), inner.clone()]),
        )?;
        Shape::unify("matmul", rhs.shape(), &Shape::new(vec![inner, cols.clone()]))?;

        let shape = Shape::new(vec![rows, cols]);
        let cost = self.cost().saturating_add(rhs.cost()).saturating_add(1);
        let lhs = self.clone();
        let rhs = rhs.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let a = ctx.lower(&lhs)?;
            let b = ctx.lower(&rhs)?;
            Ok(ctx.graph().add(
                Operation::MatMul(MatMulSpec::default()),
                vec![Output::new(a), Output::new(b)],
                spec_of(&out_shape, lhs.dtype()),
            ))
        }))
    }

    /// Extracts the generalized diagonal of a rank-`2k` expression whose
    /// halves agree pairwise, yielding the first `k` dimensions.
    pub fn diag_part(&self) -> Result<Expr<T>> {
        let (dims, flex) = self.shape().realize();
        if flex.is_some() {
            return Err(Error::bad_argument("diag_part", "rank must be known").into());
        }
        if dims.len() % 2 != 0 || dims.is_empty() {
            return Err(Error::bad_argument(
                "diag_part",
                format!("requires a non-zero even rank, got rank {}", dims.len()),
            )
            .into());
        }
        let half = dims.len() / 2;
        for i in 0..half {
            Dim::unify("diag_part", &dims[i], &dims[half + i])?;
        }

        let shape = Shape::new(dims[..half].to_vec());
        let cost = self.cost().saturating_add(1);
        let input = self.clone();
        let out_shape = shape.clone();
        Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            Ok(ctx.graph().add(
                Operation::DiagPart,
                vec![Output::new(x)],
                spec_of(&out_shape, input.dtype()),
            ))
        }))
    }
}
