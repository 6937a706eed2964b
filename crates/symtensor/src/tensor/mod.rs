pub mod builders;
pub mod dim;
pub mod dtype;
pub mod expr;
pub mod host_tensor;
pub mod ivar;
pub mod shape;

pub use builders::{
    batch, broadcast_scalar, bytes, image, matrix, pixel, placeholder, scalar, tensor3,
    tensor4, variable, vector, video,
};
pub use dim::Dim;
pub use dtype::{DType, Element, FloatElement, HostScalar, NumericElement, Utf8};
pub use expr::{AnyExpr, Expr, ExprId};
pub use host_tensor::HostTensor;
pub use ivar::IVar;
pub use shape::Shape;
