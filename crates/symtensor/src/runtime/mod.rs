mod eval;
mod runner;
mod session;

pub use eval::{eval, eval2, eval3, eval_with_weights};
pub use runner::Runner;
pub use session::{PartialRunToken, Session};
