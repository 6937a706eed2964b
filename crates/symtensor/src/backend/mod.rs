pub mod autodiff;
pub mod graph;
pub mod spec;

pub use graph::Graph;
pub use spec::{
    BackendError, BackendResult, DeviceAttributes, GraphBackend, NodeId, Operation, Output,
    RunMetadata, RunOptions, Status, StatusCode, TensorLiteral, TensorSpec,
};
