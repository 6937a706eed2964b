//! Backend capability contract consumed by the expression layer.
//!
//! The expression layer lowers into the graph representation defined here and
//! drives execution exclusively through [`GraphBackend`]. Backends own tensor
//! storage and kernels; the contract stays narrow so alternative engines can
//! be slotted in without touching shape inference or operator construction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::dtype::DType;

/// A single axis extent as seen by a backend: fully static or unknown until
/// the backend produces a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

/// Tensor metadata coupling dtype and runtime shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub dims: Vec<Dimension>,
}

impl TensorSpec {
    pub fn new(dtype: DType, dims: Vec<Dimension>) -> Self {
        TensorSpec { dtype, dims }
    }

    pub fn from_static(dtype: DType, dims: &[usize]) -> Self {
        TensorSpec {
            dtype,
            dims: dims.iter().map(|&n| Dimension::Static(n)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Static extents when no dimension is dynamic.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|d| match d {
                Dimension::Static(n) => Some(*n),
                Dimension::Dynamic => None,
            })
            .collect()
    }

    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

/// Dense literal payload used to materialize constants on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        TensorLiteral { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// A literal with every element set to `value`, for static specs.
    pub fn splat(spec: TensorSpec, value: f64) -> Option<Self> {
        let count = spec.element_count()?;
        let bytes: Vec<u8> = match spec.dtype {
            DType::F32 => (0..count).flat_map(|_| (value as f32).to_le_bytes()).collect(),
            DType::F64 => (0..count).flat_map(|_| value.to_le_bytes()).collect(),
            DType::I32 => (0..count).flat_map(|_| (value as i32).to_le_bytes()).collect(),
            DType::I64 => (0..count).flat_map(|_| (value as i64).to_le_bytes()).collect(),
            DType::Utf8 => return None,
        };
        Some(TensorLiteral::new(spec, Arc::from(bytes.into_boxed_slice())))
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Elementwise unary kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sign,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Sigmoid,
    Relu,
}

/// Elementwise binary kernels; operands broadcast pointwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Mean,
    Prod,
    Max,
    Min,
}

/// Configuration shared by every reduction node. `axes = None` reduces all
/// dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Option<Vec<usize>>,
    pub keep_dims: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl Default for MatMulSpec {
    fn default() -> Self {
        MatMulSpec {
            transpose_a: false,
            transpose_b: false,
        }
    }
}

/// Slice starts and sizes per axis; a size of `-1` extends to the end of the
/// axis, mirroring the open-endpoint slice syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub starts: Vec<usize>,
    pub sizes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqueezeSpec {
    pub axes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandDimsSpec {
    pub axis: usize,
}

/// Zero padding added below and above each axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadSpec {
    pub low: Vec<usize>,
    pub high: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    Same,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub strides: [usize; 2],
    pub padding: Padding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngTruncatedNormalSpec {
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeJpegSpec {
    pub channels: usize,
}

/// Declarative operation set understood by graph backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    Placeholder,
    Unary(UnaryOp),
    Binary(BinaryOp),
    MatMul(MatMulSpec),
    Reduce(ReduceSpec),
    DiagPart,
    Reshape,
    BroadcastTo,
    Slice(SliceSpec),
    Squeeze(SqueezeSpec),
    Pack(PackSpec),
    ExpandDims(ExpandDimsSpec),
    Pad(PadSpec),
    Conv2d(Conv2dSpec),
    Conv2dBackpropInput(Conv2dSpec),
    RngTruncatedNormal(RngTruncatedNormalSpec),
    Cast(CastSpec),
    DecodeJpeg(DecodeJpegSpec),
}

impl Operation {
    /// Stable short name used when auto-naming graph nodes.
    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "Const",
            Operation::Placeholder => "Placeholder",
            Operation::Unary(op) => match op {
                UnaryOp::Neg => "Neg",
                UnaryOp::Abs => "Abs",
                UnaryOp::Sign => "Sign",
                UnaryOp::Sin => "Sin",
                UnaryOp::Cos => "Cos",
                UnaryOp::Tan => "Tan",
                UnaryOp::Exp => "Exp",
                UnaryOp::Log => "Log",
                UnaryOp::Sqrt => "Sqrt",
                UnaryOp::Tanh => "Tanh",
                UnaryOp::Sigmoid => "Sigmoid",
                UnaryOp::Relu => "Relu",
            },
            Operation::Binary(op) => match op {
                BinaryOp::Add => "Add",
                BinaryOp::Sub => "Sub",
                BinaryOp::Mul => "Mul",
                BinaryOp::Div => "Div",
                BinaryOp::Maximum => "Maximum",
                BinaryOp::Minimum => "Minimum",
                BinaryOp::Pow => "Pow",
            },
            Operation::MatMul(_) => "MatMul",
            Operation::Reduce(spec) => match spec.kind {
                ReduceKind::Sum => "Sum",
                ReduceKind::Mean => "Mean",
                ReduceKind::Prod => "Prod",
                ReduceKind::Max => "Max",
                ReduceKind::Min => "Min",
            },
            Operation::DiagPart => "DiagPart",
            Operation::Reshape => "Reshape",
            Operation::BroadcastTo => "BroadcastTo",
            Operation::Slice(_) => "Slice",
            Operation::Squeeze(_) => "Squeeze",
            Operation::Pack(_) => "Pack",
            Operation::ExpandDims(_) => "ExpandDims",
            Operation::Pad(_) => "Pad",
            Operation::Conv2d(_) => "Conv2D",
            Operation::Conv2dBackpropInput(_) => "Conv2DBackpropInput",
            Operation::RngTruncatedNormal(_) => "TruncatedNormal",
            Operation::Cast(_) => "Cast",
            Operation::DecodeJpeg(_) => "DecodeJpeg",
        }
    }
}

/// Unique identifier for a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Reference to a single output of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
    pub node: NodeId,
    pub index: usize,
}

impl Output {
    /// The primary (index 0) output of a node.
    pub fn new(node: NodeId) -> Self {
        Output { node, index: 0 }
    }
}

/// A single operation recorded in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Operation,
    pub inputs: Vec<Output>,
    pub spec: TensorSpec,
}

/// Backend error surfaced to the expression layer.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} violates the graph contract: {message}")]
    SpecViolation { op: &'static str, message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn spec(op: &'static str, message: impl Into<String>) -> Self {
        BackendError::SpecViolation {
            op,
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BackendError::SpecViolation { .. } => StatusCode::InvalidArgument,
            BackendError::Unimplemented { .. } => StatusCode::Unimplemented,
            BackendError::Execution { .. } => StatusCode::Internal,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result codes mirrored from the backend contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Internal,
}

/// Sink for backend result codes. When a caller supplies a status, non-OK
/// results are recorded here instead of being raised.
#[derive(Debug, Clone)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn record(&mut self, error: &BackendError) {
        self.code = error.status_code();
        self.message = error.to_string();
    }

    pub fn reset(&mut self) {
        self.code = StatusCode::Ok;
        self.message.clear();
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            f.write_str("OK")
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

/// A physical device reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    pub name: String,
    pub device_type: String,
    pub memory_bytes: u64,
}

/// Opaque options buffer forwarded to the backend on each run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions(pub Vec<u8>);

/// Opaque metadata buffer a backend may fill during a run.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata(pub Vec<u8>);

/// Tag set selecting a graph variant inside a saved-model export.
pub type SavedModelTags<'a> = &'a [&'a str];

/// Weight payloads recovered from a saved-model export, keyed by name.
pub type SavedModelWeights = BTreeMap<String, TensorLiteral>;

/// Execution engine contract.
///
/// A backend owns tensor storage and kernels for the [`Operation`] set. One
/// `run` is a blocking call; backends must tolerate concurrent runs from
/// distinct threads.
pub trait GraphBackend: Send + Sync {
    type Tensor: Clone + Send + Sync + 'static;

    /// Stepwise execution state owned by a partial-run token.
    type PartialRunState: Send;

    fn name(&self) -> &str;

    /// Materializes a dense literal into a backend tensor.
    fn materialize(&self, literal: &TensorLiteral) -> BackendResult<Self::Tensor>;

    /// Reads a backend tensor back into a dense literal.
    fn to_literal(&self, tensor: &Self::Tensor) -> BackendResult<TensorLiteral>;

    /// Executes the subgraph needed for `fetches` and `targets`, feeding the
    /// given placeholder values. Returns one tensor per fetch, in order.
    fn run(
        &self,
        graph: &crate::backend::graph::Graph,
        feeds: &[(Output, Self::Tensor)],
        fetches: &[Output],
        targets: &[NodeId],
        options: Option<&RunOptions>,
        metadata: Option<&mut RunMetadata>,
    ) -> BackendResult<Vec<Self::Tensor>>;

    /// Prepares stepwise execution over the declared feeds and fetches.
    fn partial_run_setup(
        &self,
        graph: &crate::backend::graph::Graph,
        feeds: &[Output],
        fetches: &[Output],
        targets: &[NodeId],
    ) -> BackendResult<Self::PartialRunState>;

    /// Executes one step against previously established partial-run state.
    fn partial_run(
        &self,
        graph: &crate::backend::graph::Graph,
        state: &mut Self::PartialRunState,
        feeds: &[(Output, Self::Tensor)],
        fetches: &[Output],
    ) -> BackendResult<Vec<Self::Tensor>>;

    /// Releases stepwise execution state. Called exactly once per token.
    fn release_partial_run(&self, state: Self::PartialRunState) {
        drop(state);
    }

    /// Enumerates the devices this backend can place work on.
    fn devices(&self) -> BackendResult<Vec<DeviceAttributes>>;

    /// Loads weights from a saved-model export directory.
    fn load_saved_model(
        &self,
        _export_dir: &Path,
        _tags: SavedModelTags<'_>,
    ) -> BackendResult<SavedModelWeights> {
        Err(BackendError::unimplemented(
            "load_saved_model",
            "this backend does not read saved-model exports",
        ))
    }
}
