extern crate self as symtensor;

pub mod backend;
mod env;
pub mod error;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use backend::spec::{
    GraphBackend, NodeId, Output, Padding, RunMetadata, RunOptions, Status, StatusCode,
};
pub use backend::Graph;
pub use env::{live_check_enabled, set_live_check};
pub use error::Error;
pub use ops::{
    conv2d_backprop_input, curl, decode_jpeg, diff, diff_n, divergence, grad, gradients,
    gradients_with, hessian, jacobian, laplacian, stack, truncated_normal, SliceIndex,
};
pub use runtime::{eval, eval2, eval3, eval_with_weights, PartialRunToken, Runner, Session};
pub use tensor::{
    batch, broadcast_scalar, bytes, image, matrix, pixel, placeholder, scalar, tensor3,
    tensor4, variable, vector, video, AnyExpr, DType, Dim, Element, Expr, FloatElement,
    HostScalar, HostTensor, IVar, NumericElement, Shape, Utf8,
};
