//! Error kinds surfaced by the expression layer.
//!
//! Shape and argument errors are raised at construction time so no ill-formed
//! expression ever reaches a run; backend failures propagate from run paths
//! unchanged.

use std::fmt;

use thiserror::Error;

use crate::backend::spec::BackendError;

/// Explains why a pair of dimensions failed to unify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimMismatch {
    UnequalValues,
    NotDivisible,
    DifferentMultipliers,
    IncompleteDimension,
}

impl fmt::Display for DimMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DimMismatch::UnequalValues => "unequal values",
            DimMismatch::NotDivisible => "not divisible",
            DimMismatch::DifferentMultipliers => "different multipliers",
            DimMismatch::IncompleteDimension => "incomplete dimension",
        };
        f.write_str(reason)
    }
}

/// Typed failure raised by shape inference, argument validation, and runs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: cannot unify expected shape {expected} with actual shape {actual}")]
    ShapeMismatch {
        op: String,
        expected: String,
        actual: String,
    },
    #[error("{op}: dimension {left} conflicts with {right} ({reason})")]
    DimMismatch {
        op: String,
        left: String,
        right: String,
        reason: DimMismatch,
    },
    #[error("{op}: {message}")]
    BadArgument { op: String, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{handle} was used after being closed")]
    DisposedHandle { handle: &'static str },
    #[error("malformed fetch specification '{fetch}': {message}")]
    Parse { fetch: String, message: String },
}

impl Error {
    pub(crate) fn bad_argument(op: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadArgument {
            op: op.into(),
            message: message.into(),
        }
    }
}
