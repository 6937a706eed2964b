//! Symbolic shape algebra.
//!
//! A shape is an ordered sequence of [`Dim`]s plus an optional "flex" tail:
//! an inference variable that may expand into additional dimensions during
//! unification. A rank-0 shape with no flex tail is a scalar; a rank-0 shape
//! with a flex tail is a scalar broadcastable to any rank.

use std::fmt;

use crate::error::Error;
use crate::tensor::dim::Dim;
use crate::tensor::ivar::IVar;

#[derive(Clone, Debug)]
pub struct Shape {
    dims: Vec<Dim>,
    flex: Option<IVar<Shape>>,
}

impl Shape {
    /// A closed shape with exactly the given dimensions.
    pub fn new(dims: Vec<Dim>) -> Self {
        Shape { dims, flex: None }
    }

    /// A shape whose known prefix may be extended through a flex tail.
    pub fn flexible(dims: Vec<Dim>) -> Self {
        Shape {
            dims,
            flex: Some(IVar::unsolved()),
        }
    }

    /// The closed rank-0 shape.
    pub fn scalar() -> Self {
        Shape::new(Vec::new())
    }

    /// A rank-0 shape that broadcasts to any rank during unification.
    pub fn broadcastable_scalar() -> Self {
        Shape::flexible(Vec::new())
    }

    /// A closed shape of fully known extents.
    pub fn known(dims: &[usize]) -> Self {
        Shape::new(dims.iter().map(|&n| Dim::Known(n)).collect())
    }

    /// A closed shape of `rank` fresh inference variables.
    pub fn inferred(rank: usize) -> Self {
        Shape::new((0..rank).map(|_| Dim::inferred()).collect())
    }

    /// Reassembles a shape from a realized prefix and an optional open tail.
    pub(crate) fn from_parts(dims: Vec<Dim>, flex: Option<IVar<Shape>>) -> Self {
        Shape { dims, flex }
    }

    /// Flattens solved flex tails into a canonical `(prefix, open tail)` view.
    pub fn realize(&self) -> (Vec<Dim>, Option<IVar<Shape>>) {
        let mut dims = self.dims.clone();
        let mut flex = self.flex.clone();
        while let Some(var) = flex {
            match var.solution() {
                Some(tail) => {
                    let (tail_dims, tail_flex) = tail.realize();
                    dims.extend(tail_dims);
                    flex = tail_flex;
                }
                None => return (dims, Some(var)),
            }
        }
        (dims, None)
    }

    /// The rank, when the shape is closed (no open flex tail).
    pub fn rank(&self) -> Option<usize> {
        let (dims, flex) = self.realize();
        if flex.is_some() {
            None
        } else {
            Some(dims.len())
        }
    }

    /// The realized dimension prefix.
    pub fn dims(&self) -> Vec<Dim> {
        self.realize().0
    }

    /// Concrete extents when every realized dimension is resolved and the
    /// flex tail, if any, is still open (an open tail contributes nothing
    /// at run time).
    pub fn runtime_dims(&self) -> Option<Vec<usize>> {
        self.realize().0.iter().map(Dim::value).collect()
    }

    pub fn is_scalar(&self) -> bool {
        self.realize().0.is_empty()
    }

    /// Makes `a` and `b` denote the same shape, unifying pairwise from the
    /// front and extending the shorter side through its flex tail.
    pub fn unify(op: &str, a: &Shape, b: &Shape) -> Result<(), Error> {
        let (ad, af) = a.realize();
        let (bd, bf) = b.realize();

        for (x, y) in ad.iter().zip(bd.iter()) {
            Dim::unify(op, x, y)?;
        }

        if ad.len() == bd.len() {
            return match (af, bf) {
                (None, None) => Ok(()),
                (Some(v), Some(w)) if v.same(&w) => Ok(()),
                (Some(v), Some(w)) => {
                    let _ = v.solve(Shape {
                        dims: Vec::new(),
                        flex: Some(w),
                    });
                    Ok(())
                }
                (Some(v), None) | (None, Some(v)) => {
                    let _ = v.solve(Shape::scalar());
                    Ok(())
                }
            };
        }

        // One side is shorter: grow it through its flex tail and retry.
        let (longer_len, shorter_len, shorter_flex) = if ad.len() > bd.len() {
            (ad.len(), bd.len(), bf)
        } else {
            (bd.len(), ad.len(), af)
        };
        match shorter_flex {
            Some(var) => {
                let fresh = Shape::flexible(
                    (0..longer_len - shorter_len).map(|_| Dim::inferred()).collect(),
                );
                let _ = var.solve(fresh);
                Shape::unify(op, a, b)
            }
            None => Err(Error::ShapeMismatch {
                op: op.to_string(),
                expected: a.to_string(),
                actual: b.to_string(),
            }),
        }
    }

    /// Broadcasting convention for pointwise operators: unify and return the
    /// merged shape. Strict operators use [`Shape::unify`] directly.
    pub fn equiv(op: &str, a: &Shape, b: &Shape) -> Result<Shape, Error> {
        Shape::unify(op, a, b)?;
        // After unification both sides denote the same shape; prefer the one
        // with the longer realized prefix so callers see concrete dims.
        if a.realize().0.len() >= b.realize().0.len() {
            Ok(a.clone())
        } else {
            Ok(b.clone())
        }
    }

    /// Ensures the shape has rank at least `n`, solving an open flex tail to
    /// fresh inferred dimensions when it is shorter.
    pub fn min_rank(op: &str, shape: &Shape, n: usize) -> Result<(), Error> {
        let (dims, flex) = shape.realize();
        if dims.len() >= n {
            return Ok(());
        }
        match flex {
            Some(var) => {
                let fresh =
                    Shape::flexible((0..n - dims.len()).map(|_| Dim::inferred()).collect());
                let _ = var.solve(fresh);
                Ok(())
            }
            None => Err(Error::ShapeMismatch {
                op: op.to_string(),
                expected: format!("a shape of rank >= {n}"),
                actual: shape.to_string(),
            }),
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::known(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::known(&dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (dims, flex) = self.realize();
        f.write_str("[")?;
        for (i, d) in dims.iter().enumerate() {
            if i > 0 {
                f.write_str("x")?;
            }
            write!(f, "{d}")?;
        }
        if flex.is_some() {
            if !dims.is_empty() {
                f.write_str("x")?;
            }
            f.write_str("...")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unify_is_reflexive() {
        let s = Shape::new(vec![Dim::known(4), Dim::inferred()]);
        Shape::unify("test", &s, &s).unwrap();
        assert!(s.dims()[1].value().is_none());
    }

    #[test]
    fn unify_solves_pairwise() {
        let a = Shape::new(vec![Dim::known(2), Dim::inferred()]);
        let b = Shape::new(vec![Dim::inferred(), Dim::known(3)]);
        Shape::unify("test", &a, &b).unwrap();
        assert_eq!(a.runtime_dims(), Some(vec![2, 3]));
        assert_eq!(b.runtime_dims(), Some(vec![2, 3]));
    }

    #[test]
    fn unify_propagates_stride_arithmetic() {
        // [4, ?] against [?*2, 5]: the first dim forces the inner var to 2,
        // the second inferred dim solves to 5.
        let inner = Dim::inferred();
        let a = Shape::new(vec![Dim::known(4), Dim::inferred()]);
        let b = Shape::new(vec![inner.times(2), Dim::known(5)]);
        Shape::unify("test", &a, &b).unwrap();
        assert_eq!(inner.value(), Some(2));
        assert_eq!(a.runtime_dims(), Some(vec![4, 5]));
    }

    #[test]
    fn closed_rank_mismatch_fails() {
        let a = Shape::known(&[2, 3]);
        let b = Shape::known(&[2, 3, 4]);
        let err = Shape::unify("test", &a, &b).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn flex_scalar_promotes_to_vector() {
        let a = Shape::broadcastable_scalar();
        let b = Shape::known(&[3]);
        Shape::unify("test", &a, &b).unwrap();
        assert_eq!(a.runtime_dims(), Some(vec![3]));
        // The closed right-hand side closes the remaining tail as well.
        assert_eq!(a.rank(), Some(1));
    }

    #[test]
    fn flex_tails_link_at_equal_rank() {
        let a = Shape::flexible(vec![Dim::known(2)]);
        let b = Shape::flexible(vec![Dim::known(2)]);
        Shape::unify("test", &a, &b).unwrap();
        // Extending one side now extends the other.
        let c = Shape::known(&[2, 7]);
        Shape::unify("test", &a, &c).unwrap();
        assert_eq!(b.runtime_dims(), Some(vec![2, 7]));
    }

    #[test]
    fn flex_closes_against_a_closed_shape() {
        let a = Shape::flexible(vec![Dim::known(2)]);
        let b = Shape::known(&[2]);
        Shape::unify("test", &a, &b).unwrap();
        assert_eq!(a.rank(), Some(1));
    }

    #[test]
    fn min_rank_grows_open_shapes() {
        let s = Shape::broadcastable_scalar();
        Shape::min_rank("test", &s, 2).unwrap();
        assert!(s.dims().len() >= 2);
    }

    #[test]
    fn min_rank_rejects_short_closed_shapes() {
        let s = Shape::known(&[3]);
        assert!(Shape::min_rank("test", &s, 2).is_err());
        Shape::min_rank("test", &s, 1).unwrap();
    }

    #[test]
    fn display_renders_partial_shapes() {
        let s = Shape::new(vec![Dim::known(2), Dim::inferred()]);
        assert_eq!(s.to_string(), "[2x?]");
        assert_eq!(Shape::scalar().to_string(), "[]");
        assert_eq!(Shape::broadcastable_scalar().to_string(), "[...]");
    }
}
