//! Single-assignment inference cells shared between symbolic shapes.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

/// A write-once cell used by unification to propagate partial solutions.
///
/// An `IVar` starts unsolved, transitions to solved at most once, and never
/// reverts. Clones share the underlying cell, so a solution recorded through
/// one handle is immediately visible through every other handle. Identity is
/// pointer identity of the shared cell, not structural equality.
pub struct IVar<T> {
    cell: Arc<OnceCell<T>>,
}

impl<T> IVar<T> {
    /// Creates a fresh unsolved variable.
    pub fn unsolved() -> Self {
        IVar {
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Returns the recorded solution, if any.
    pub fn solution(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_solved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Records a solution, failing with the existing value if one was
    /// already recorded. Unification uses the returned value to decide
    /// whether a second solve is compatible.
    pub fn solve(&self, value: T) -> Result<(), &T> {
        match self.cell.set(value) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.cell.get().expect("solved cell must hold a value")),
        }
    }

    /// True when both handles refer to the same underlying cell.
    pub fn same(&self, other: &IVar<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Clone for IVar<T> {
    fn clone(&self) -> Self {
        IVar {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for IVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(value) => f.debug_tuple("Solved").field(value).finish(),
            None => f.write_str("Unsolved"),
        }
    }
}
