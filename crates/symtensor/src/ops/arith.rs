//! Pointwise arithmetic over expressions.
//!
//! Binary operators unify operand shapes with broadcasting (flex-tail rank
//! extension); unary operators preserve shape exactly. The `std::ops`
//! implementations are sugar over the `try_*` constructors and panic on a
//! shape mismatch, which is a programmer error caught at construction time.

use anyhow::Result;

use crate::backend::spec::{BinaryOp, Operation, Output, UnaryOp};
use crate::ops::lower::{spec_of, Lowering};
use crate::tensor::builders::broadcast_scalar;
use crate::tensor::dtype::{FloatElement, HostScalar, NumericElement};
use crate::tensor::expr::Expr;
use crate::tensor::shape::Shape;

fn binary<T: NumericElement>(
    name: &'static str,
    kind: BinaryOp,
    lhs: &Expr<T>,
    rhs: &Expr<T>,
) -> Result<Expr<T>> {
    let shape = Shape::equiv(name, lhs.shape(), rhs.shape())?;
    let cost = lhs.cost().saturating_add(rhs.cost()).saturating_add(1);
    let lhs = lhs.clone();
    let rhs = rhs.clone();
    let out_shape = shape.clone();
    Ok(Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let a = ctx.lower(&lhs)?;
        let b = ctx.lower(&rhs)?;
        let spec = spec_of(&out_shape, T::DTYPE);
        Ok(ctx
            .graph()
            .add(Operation::Binary(kind), vec![Output::new(a), Output::new(b)], spec))
    }))
}

fn unary<T: NumericElement>(kind: UnaryOp, input: &Expr<T>) -> Expr<T> {
    let shape = input.shape().clone();
    let cost = input.cost().saturating_add(1);
    let input = input.clone();
    let out_shape = shape.clone();
    Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
        let x = ctx.lower(&input)?;
        let spec = spec_of(&out_shape, input.dtype());
        Ok(ctx.graph().add(Operation::Unary(kind), vec![Output::new(x)], spec))
    })
}

impl<T: NumericElement> Expr<T> {
    pub fn try_add(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("add", BinaryOp::Add, self, rhs)
    }

    pub fn try_sub(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("sub", BinaryOp::Sub, self, rhs)
    }

    pub fn try_mul(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("mul", BinaryOp::Mul, self, rhs)
    }

    pub fn try_div(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("div", BinaryOp::Div, self, rhs)
    }

    /// Elementwise maximum with broadcasting.
    pub fn maximum(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("maximum", BinaryOp::Maximum, self, rhs)
    }

    /// Elementwise minimum with broadcasting.
    pub fn minimum(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("minimum", BinaryOp::Minimum, self, rhs)
    }

    pub fn neg(&self) -> Expr<T> {
        unary(UnaryOp::Neg, self)
    }

    pub fn abs(&self) -> Expr<T> {
        unary(UnaryOp::Abs, self)
    }

    /// Elementwise sign (`-1`, `0`, or `1`).
    pub fn sign(&self) -> Expr<T> {
        unary(UnaryOp::Sign, self)
    }
}

impl<T: FloatElement> Expr<T> {
    pub fn try_pow(&self, rhs: &Expr<T>) -> Result<Expr<T>> {
        binary("pow", BinaryOp::Pow, self, rhs)
    }

    pub fn sin(&self) -> Expr<T> {
        unary(UnaryOp::Sin, self)
    }

    pub fn cos(&self) -> Expr<T> {
        unary(UnaryOp::Cos, self)
    }

    pub fn tan(&self) -> Expr<T> {
        unary(UnaryOp::Tan, self)
    }

    pub fn exp(&self) -> Expr<T> {
        unary(UnaryOp::Exp, self)
    }

    pub fn log(&self) -> Expr<T> {
        unary(UnaryOp::Log, self)
    }

    pub fn sqrt(&self) -> Expr<T> {
        unary(UnaryOp::Sqrt, self)
    }

    pub fn tanh(&self) -> Expr<T> {
        unary(UnaryOp::Tanh, self)
    }

    pub fn sigmoid(&self) -> Expr<T> {
        unary(UnaryOp::Sigmoid, self)
    }

    pub fn relu(&self) -> Expr<T> {
        unary(UnaryOp::Relu, self)
    }
}

impl<T: NumericElement> Expr<T> {
    /// Explicit conversion between numeric element types; the shape is
    /// carried over unchanged.
    pub fn cast<U: NumericElement>(&self) -> Expr<U> {
        let shape = self.shape().clone();
        let cost = self.cost().saturating_add(1);
        let input = self.clone();
        let out_shape = shape.clone();
        Expr::from_build(shape, cost, move |ctx: &mut Lowering| {
            let x = ctx.lower(&input)?;
            let spec = spec_of(&out_shape, U::DTYPE);
            Ok(ctx.graph().add(
                Operation::Cast(crate::backend::spec::CastSpec { dtype: U::DTYPE }),
                vec![Output::new(x)],
                spec,
            ))
        })
    }
}

fn expect<T: NumericElement>(result: Result<Expr<T>>) -> Expr<T> {
    match result {
        Ok(expr) => expr,
        Err(err) => panic!("{err}"),
    }
}

macro_rules! expr_binop {
    ($trait:ident, $method:ident, $ctor:ident) => {
        impl<T: NumericElement> std::ops::$trait<&Expr<T>> for &Expr<T> {
            type Output = Expr<T>;

            fn $method(self, rhs: &Expr<T>) -> Expr<T> {
                expect(self.$ctor(rhs))
            }
        }

        impl<T: NumericElement> std::ops::$trait<Expr<T>> for Expr<T> {
            type Output = Expr<T>;

            fn $method(self, rhs: Expr<T>) -> Expr<T> {
                expect(self.$ctor(&rhs))
            }
        }

        impl<T: NumericElement> std::ops::$trait<&Expr<T>> for Expr<T> {
            type Output = Expr<T>;

            fn $method(self, rhs: &Expr<T>) -> Expr<T> {
                expect(self.$ctor(rhs))
            }
        }

        impl<T: NumericElement + HostScalar> std::ops::$trait<T> for &Expr<T> {
            type Output = Expr<T>;

            fn $method(self, rhs: T) -> Expr<T> {
                expect(self.$ctor(&broadcast_scalar(rhs)))
            }
        }

        impl<T: NumericElement + HostScalar> std::ops::$trait<T> for Expr<T> {
            type Output = Expr<T>;

            fn $method(self, rhs: T) -> Expr<T> {
                expect(self.$ctor(&broadcast_scalar(rhs)))
            }
        }
    };
}

expr_binop!(Add, add, try_add);
expr_binop!(Sub, sub, try_sub);
expr_binop!(Mul, mul, try_mul);
expr_binop!(Div, div, try_div);

impl<T: NumericElement> std::ops::Neg for &Expr<T> {
    type Output = Expr<T>;

    fn neg(self) -> Expr<T> {
        Expr::neg(self)
    }
}

impl<T: NumericElement> std::ops::Neg for Expr<T> {
    type Output = Expr<T>;

    fn neg(self) -> Expr<T> {
        Expr::neg(&self)
    }
}
