pub mod arith;
pub mod conv;
pub mod grad;
pub mod image;
pub mod linalg;
pub mod lower;
pub mod reduce;
pub mod shape_ops;
pub mod stochastic;

pub use conv::conv2d_backprop_input;
pub use grad::{
    curl, diff, diff_n, divergence, grad, gradients, gradients_with, hessian, jacobian,
    laplacian,
};
pub use image::decode_jpeg;
pub use lower::Lowering;
pub use shape_ops::{stack, SliceIndex};
pub use stochastic::{truncated_normal, truncated_normal_seeded};
