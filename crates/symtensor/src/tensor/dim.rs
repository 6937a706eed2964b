//! Symbolic dimension algebra.
//!
//! A dimension is either a known extent, an inference variable, or a
//! multiple/divisor of another dimension. The `Mul`/`Div` forms exist to
//! propagate stride arithmetic through convolution and slicing without
//! forcing callers to name every intermediate extent; `Div` uses ceiling
//! division to match striding semantics.

use std::fmt;
use std::sync::Arc;

use crate::error::{DimMismatch, Error};
use crate::tensor::ivar::IVar;

/// A single symbolic axis extent.
#[derive(Clone, Debug)]
pub enum Dim {
    Known(usize),
    Var(IVar<Dim>),
    Mul(Arc<Dim>, usize),
    Div(Arc<Dim>, usize),
}

impl Dim {
    pub fn known(n: usize) -> Self {
        Dim::Known(n)
    }

    /// A fresh open dimension backed by an unsolved inference variable.
    pub fn inferred() -> Self {
        Dim::Var(IVar::unsolved())
    }

    /// `self * k`. A factor of one is the identity.
    pub fn times(&self, k: usize) -> Self {
        if k == 1 {
            self.clone()
        } else {
            Dim::Mul(Arc::new(self.clone()), k)
        }
    }

    /// `ceil(self / k)`. A divisor of one is the identity.
    pub fn div_ceil(&self, k: usize) -> Self {
        if k == 1 {
            self.clone()
        } else {
            Dim::Div(Arc::new(self.clone()), k)
        }
    }

    /// The concrete extent, when every variable on the path is solved.
    pub fn value(&self) -> Option<usize> {
        match self {
            Dim::Known(n) => Some(*n),
            Dim::Var(v) => v.solution().and_then(Dim::value),
            Dim::Mul(d, k) => d.value().map(|n| n * k),
            Dim::Div(d, k) => d.value().map(|n| n.div_ceil(*k)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.value().is_some()
    }

    /// Follows solved variables transitively, yielding the canonical form.
    pub fn strip(&self) -> Dim {
        match self {
            Dim::Var(v) => match v.solution() {
                Some(inner) => inner.strip(),
                None => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Makes `a` and `b` denote the same extent, solving inference variables
    /// where possible. `op` names the operator for diagnostics.
    pub fn unify(op: &str, a: &Dim, b: &Dim) -> Result<(), Error> {
        if let (Some(x), Some(y)) = (a.value(), b.value()) {
            if x == y {
                return Ok(());
            }
            return Err(mismatch(op, a, b, DimMismatch::UnequalValues));
        }

        let sa = a.strip();
        let sb = b.strip();
        match (&sa, &sb) {
            (Dim::Var(v), Dim::Var(w)) if v.same(w) => Ok(()),
            (Dim::Var(v), other) => {
                // strip() guarantees the variable is unsolved here.
                let _ = v.solve(other.clone());
                Ok(())
            }
            (other, Dim::Var(w)) => {
                let _ = w.solve(other.clone());
                Ok(())
            }
            (Dim::Mul(d, k), Dim::Known(n)) | (Dim::Known(n), Dim::Mul(d, k)) => {
                if n % k != 0 {
                    return Err(mismatch(op, a, b, DimMismatch::NotDivisible));
                }
                Dim::unify(op, d, &Dim::Known(n / k))
            }
            (Dim::Mul(d1, k1), Dim::Mul(d2, k2)) => {
                if k1 != k2 {
                    return Err(mismatch(op, a, b, DimMismatch::DifferentMultipliers));
                }
                Dim::unify(op, d1, d2)
            }
            (Dim::Div(d1, k1), Dim::Div(d2, k2)) => {
                if k1 != k2 {
                    return Err(mismatch(op, a, b, DimMismatch::DifferentMultipliers));
                }
                Dim::unify(op, d1, d2)
            }
            _ => {
                // Both sides open: leave the constraint latent. If exactly one
                // side has a concrete extent the other cannot reach, report it.
                if sa.value().is_none() && sb.value().is_none() {
                    Ok(())
                } else {
                    Err(mismatch(op, a, b, DimMismatch::IncompleteDimension))
                }
            }
        }
    }
}

fn mismatch(op: &str, left: &Dim, right: &Dim, reason: DimMismatch) -> Error {
    Error::DimMismatch {
        op: op.to_string(),
        left: left.to_string(),
        right: right.to_string(),
        reason,
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Known(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(n) => write!(f, "{n}"),
            None => match self {
                Dim::Known(n) => write!(f, "{n}"),
                Dim::Var(_) => f.write_str("?"),
                Dim::Mul(d, k) => write!(f, "{d}*{k}"),
                Dim::Div(d, k) => write!(f, "{d}/{k}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_dims_unify_on_equality() {
        assert!(Dim::unify("test", &Dim::known(4), &Dim::known(4)).is_ok());
        let err = Dim::unify("test", &Dim::known(4), &Dim::known(5)).unwrap_err();
        assert!(err.to_string().contains("unequal values"));
    }

    #[test]
    fn variable_solves_to_known() {
        let v = Dim::inferred();
        Dim::unify("test", &v, &Dim::known(7)).unwrap();
        assert_eq!(v.value(), Some(7));
        // A second, compatible unification is a no-op.
        Dim::unify("test", &v, &Dim::known(7)).unwrap();
        assert!(Dim::unify("test", &v, &Dim::known(8)).is_err());
    }

    #[test]
    fn solution_is_shared_between_clones() {
        let v = Dim::inferred();
        let alias = v.clone();
        Dim::unify("test", &v, &Dim::known(3)).unwrap();
        assert_eq!(alias.value(), Some(3));
    }

    #[test]
    fn multiple_of_divides_known() {
        let inner = Dim::inferred();
        let doubled = inner.times(2);
        Dim::unify("test", &doubled, &Dim::known(8)).unwrap();
        assert_eq!(inner.value(), Some(4));
    }

    #[test]
    fn multiple_of_rejects_indivisible() {
        let doubled = Dim::inferred().times(2);
        let err = Dim::unify("test", &doubled, &Dim::known(9)).unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn mismatched_factors_are_rejected() {
        let a = Dim::inferred().times(2);
        let b = Dim::inferred().times(3);
        let err = Dim::unify("test", &a, &b).unwrap_err();
        assert!(err.to_string().contains("different multipliers"));
    }

    #[test]
    fn equal_factors_recurse() {
        let x = Dim::inferred();
        let y = Dim::inferred();
        Dim::unify("test", &x.times(2), &y.times(2)).unwrap();
        Dim::unify("test", &x, &Dim::known(5)).unwrap();
        assert_eq!(y.value(), Some(5));
    }

    #[test]
    fn divisor_uses_ceiling_division() {
        let d = Dim::known(7).div_ceil(2);
        assert_eq!(d.value(), Some(4));
    }

    #[test]
    fn open_pairs_remain_open() {
        let a = Dim::inferred().times(2);
        let b = Dim::inferred().div_ceil(3);
        assert!(Dim::unify("test", &a, &b).is_ok());
        assert!(a.value().is_none());
    }

    #[test]
    fn open_divisor_against_known_is_incomplete() {
        let open = Dim::inferred().div_ceil(2);
        let err = Dim::unify("test", &open, &Dim::known(4)).unwrap_err();
        assert!(err.to_string().contains("incomplete dimension"));
    }

    #[test]
    fn unify_is_symmetric() {
        let v = Dim::inferred();
        Dim::unify("test", &Dim::known(6), &v.times(3)).unwrap();
        assert_eq!(v.value(), Some(2));
    }
}
