//! Lazy, typed tensor expressions.
//!
//! An expression records what to compute — its inferred shape, a heuristic
//! cost, and a deferred build closure — without touching a backend. Heavy
//! backend objects are only created when a run materializes the expression
//! through a [`Lowering`] context.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::NodeId;
use crate::ops::lower::Lowering;
use crate::tensor::dtype::{DType, Element};
use crate::tensor::host_tensor::HostTensor;
use crate::tensor::shape::Shape;

/// Cost assigned to constants.
pub(crate) const COST_CONSTANT: u32 = 0;
/// Cost assigned to gradient and variable nodes to discourage eager display.
pub(crate) const COST_OPAQUE: u32 = 100;

pub(crate) type BuildFn = dyn Fn(&mut Lowering) -> Result<NodeId> + Send + Sync;
pub(crate) type LiteralFn = dyn Fn() -> HostTensor + Send + Sync;

pub(crate) struct ExprInner {
    shape: Shape,
    dtype: DType,
    cost: u32,
    build: Box<BuildFn>,
    literal: Option<Arc<LiteralFn>>,
}

/// Identity of an expression node. Two separately constructed expressions
/// with identical semantics are distinct nodes; memoization is by identity,
/// never by structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(usize);

/// A lazy tensor expression with element type `T`.
pub struct Expr<T: Element> {
    inner: Arc<ExprInner>,
    _tag: PhantomData<fn() -> T>,
}

impl<T: Element> Expr<T> {
    /// Wraps a build closure into an expression node.
    pub(crate) fn from_build(
        shape: Shape,
        cost: u32,
        build: impl Fn(&mut Lowering) -> Result<NodeId> + Send + Sync + 'static,
    ) -> Self {
        Expr {
            inner: Arc::new(ExprInner {
                shape,
                dtype: T::DTYPE,
                cost,
                build: Box::new(build),
                literal: None,
            }),
            _tag: PhantomData,
        }
    }

    /// A constant expression with a materializable payload. The payload thunk
    /// lets callers side-step graph construction entirely.
    pub(crate) fn from_literal(
        shape: Shape,
        literal: impl Fn() -> HostTensor + Send + Sync + 'static,
    ) -> Self {
        let literal: Arc<LiteralFn> = Arc::new(literal);
        let build_literal = Arc::clone(&literal);
        let build = move |ctx: &mut Lowering| {
            let host = build_literal();
            Ok(ctx.graph().add(
                crate::backend::spec::Operation::Constant(host.to_literal()),
                Vec::new(),
                crate::backend::spec::TensorSpec::from_static(host.dtype(), host.dims()),
            ))
        };
        Expr {
            inner: Arc::new(ExprInner {
                shape,
                dtype: T::DTYPE,
                cost: COST_CONSTANT,
                build: Box::new(build),
                literal: Some(literal),
            }),
            _tag: PhantomData,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Heuristic tree weight; used only to gate eager evaluation in display
    /// paths (constants are free, gradients and variables deliberately heavy).
    pub fn cost(&self) -> u32 {
        self.inner.cost
    }

    pub fn id(&self) -> ExprId {
        ExprId(Arc::as_ptr(&self.inner) as usize)
    }

    /// The constant payload, when this expression is a literal.
    pub fn literal_value(&self) -> Option<HostTensor> {
        self.inner.literal.as_ref().map(|thunk| thunk())
    }

    /// Type-erases the expression for heterogeneous containers.
    pub fn erase(&self) -> AnyExpr {
        AnyExpr {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Reinterprets an erased expression, validating the element type.
    pub fn from_erased(any: &AnyExpr) -> Option<Self> {
        if any.dtype() == T::DTYPE {
            Some(Expr {
                inner: Arc::clone(&any.inner),
                _tag: PhantomData,
            })
        } else {
            None
        }
    }
}

impl<T: Element> Clone for Expr<T> {
    fn clone(&self) -> Self {
        Expr {
            inner: Arc::clone(&self.inner),
            _tag: PhantomData,
        }
    }
}

impl<T: Element> fmt::Debug for Expr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expr")
            .field("shape", &self.inner.shape.to_string())
            .field("dtype", &self.inner.dtype)
            .field("cost", &self.inner.cost)
            .finish()
    }
}

/// An expression with its element type erased.
#[derive(Clone)]
pub struct AnyExpr {
    inner: Arc<ExprInner>,
}

impl AnyExpr {
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn cost(&self) -> u32 {
        self.inner.cost
    }

    pub fn id(&self) -> ExprId {
        ExprId(Arc::as_ptr(&self.inner) as usize)
    }

    pub(crate) fn build(&self, ctx: &mut Lowering) -> Result<NodeId> {
        (self.inner.build)(ctx)
    }
}

impl fmt::Debug for AnyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyExpr")
            .field("shape", &self.inner.shape.to_string())
            .field("dtype", &self.inner.dtype)
            .finish()
    }
}
