//! Reference interpreter for symtensor graphs.
//!
//! Nodes are evaluated recursively with per-run memoization; feeds override
//! node results by identity. The kernel set is complete for `f32`, with
//! `f64` covered for elementwise, matmul, and reductions and the integer
//! types for elementwise arithmetic, packing, slicing, and casts. Anything
//! else reports a typed unimplemented error rather than guessing.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use symtensor::backend::graph::Graph;
use symtensor::backend::spec::{
    BackendError, BackendResult, BinaryOp, CastSpec, Conv2dSpec, DeviceAttributes, GraphBackend,
    MatMulSpec, Node, NodeId, Operation, Output, PackSpec, PadSpec, Padding, ReduceKind,
    ReduceSpec, RunMetadata, RunOptions, SliceSpec, SqueezeSpec, TensorLiteral, TensorSpec,
    UnaryOp,
};
use symtensor::tensor::dtype::DType;

#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    Bytes(Arc<[u8]>),
}

impl CpuTensor {
    fn from_f32(dims: Vec<usize>, values: Vec<f32>) -> Self {
        CpuTensor {
            spec: TensorSpec::from_static(DType::F32, &dims),
            data: TensorData::F32(Arc::from(values.into_boxed_slice())),
        }
    }

    fn from_f64(dims: Vec<usize>, values: Vec<f64>) -> Self {
        CpuTensor {
            spec: TensorSpec::from_static(DType::F64, &dims),
            data: TensorData::F64(Arc::from(values.into_boxed_slice())),
        }
    }

    fn from_i32(dims: Vec<usize>, values: Vec<i32>) -> Self {
        CpuTensor {
            spec: TensorSpec::from_static(DType::I32, &dims),
            data: TensorData::I32(Arc::from(values.into_boxed_slice())),
        }
    }

    fn from_i64(dims: Vec<usize>, values: Vec<i64>) -> Self {
        CpuTensor {
            spec: TensorSpec::from_static(DType::I64, &dims),
            data: TensorData::I64(Arc::from(values.into_boxed_slice())),
        }
    }

    fn dims(&self) -> BackendResult<Vec<usize>> {
        self.spec
            .static_dims()
            .ok_or_else(|| BackendError::execution("tensor carries dynamic dimensions"))
    }

    fn f32s(&self) -> BackendResult<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            _ => Err(BackendError::execution("expected f32 tensor data")),
        }
    }
}

/// Reference CPU execution engine.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

/// Stepwise state for one partial run: results computed so far plus the
/// declared ports.
pub struct CpuPartialRun {
    cache: HashMap<u32, CpuTensor>,
    declared_feeds: Vec<Output>,
    declared_fetches: Vec<Output>,
    targets: Vec<NodeId>,
}

impl GraphBackend for CpuBackend {
    type Tensor = CpuTensor;
    type PartialRunState = CpuPartialRun;

    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn materialize(&self, literal: &TensorLiteral) -> BackendResult<Self::Tensor> {
        literal_to_tensor(literal)
    }

    fn to_literal(&self, tensor: &Self::Tensor) -> BackendResult<TensorLiteral> {
        tensor_to_literal(tensor)
    }

    fn run(
        &self,
        graph: &Graph,
        feeds: &[(Output, Self::Tensor)],
        fetches: &[Output],
        targets: &[NodeId],
        _options: Option<&RunOptions>,
        _metadata: Option<&mut RunMetadata>,
    ) -> BackendResult<Vec<Self::Tensor>> {
        let nodes = graph.nodes();
        let mut memo = seed_feeds(&nodes, feeds)?;
        for &target in targets {
            eval_node(&nodes, target, &mut memo)?;
        }
        let mut results = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            check_primary(&nodes, *fetch)?;
            results.push(eval_node(&nodes, fetch.node, &mut memo)?);
        }
        Ok(results)
    }

    fn partial_run_setup(
        &self,
        graph: &Graph,
        feeds: &[Output],
        fetches: &[Output],
        targets: &[NodeId],
    ) -> BackendResult<Self::PartialRunState> {
        let nodes = graph.nodes();
        for port in feeds.iter().chain(fetches.iter()) {
            check_primary(&nodes, *port)?;
        }
        Ok(CpuPartialRun {
            cache: HashMap::new(),
            declared_feeds: feeds.to_vec(),
            declared_fetches: fetches.to_vec(),
            targets: targets.to_vec(),
        })
    }

    fn partial_run(
        &self,
        graph: &Graph,
        state: &mut Self::PartialRunState,
        feeds: &[(Output, Self::Tensor)],
        fetches: &[Output],
    ) -> BackendResult<Vec<Self::Tensor>> {
        let nodes = graph.nodes();
        for (port, value) in feeds {
            if !state.declared_feeds.contains(port) {
                return Err(BackendError::spec(
                    "partial_run",
                    format!("feed {:?} was not declared at setup", port),
                ));
            }
            state.cache.insert(port.node.0, value.clone());
        }
        for &target in &state.targets {
            eval_node(&nodes, target, &mut state.cache)?;
        }
        let mut results = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            if !state.declared_fetches.contains(fetch) {
                return Err(BackendError::spec(
                    "partial_run",
                    format!("fetch {:?} was not declared at setup", fetch),
                ));
            }
            results.push(eval_node(&nodes, fetch.node, &mut state.cache)?);
        }
        Ok(results)
    }

    fn devices(&self) -> BackendResult<Vec<DeviceAttributes>> {
        Ok(vec![DeviceAttributes {
            name: "/device:CPU:0".to_string(),
            device_type: "CPU".to_string(),
            memory_bytes: 0,
        }])
    }
}

fn check_primary(nodes: &[Node], port: Output) -> BackendResult<()> {
    if port.node.0 as usize >= nodes.len() {
        return Err(BackendError::spec(
            "run",
            format!("node {:?} is not part of this graph", port.node),
        ));
    }
    if port.index != 0 {
        return Err(BackendError::spec(
            "run",
            format!(
                "operation '{}' has a single output, index {} requested",
                nodes[port.node.0 as usize].name, port.index
            ),
        ));
    }
    Ok(())
}

fn seed_feeds(
    nodes: &[Node],
    feeds: &[(Output, CpuTensor)],
) -> BackendResult<HashMap<u32, CpuTensor>> {
    let mut memo = HashMap::with_capacity(feeds.len());
    for (port, value) in feeds {
        check_primary(nodes, *port)?;
        memo.insert(port.node.0, value.clone());
    }
    Ok(memo)
}

fn eval_node(
    nodes: &[Node],
    id: NodeId,
    memo: &mut HashMap<u32, CpuTensor>,
) -> BackendResult<CpuTensor> {
    if let Some(cached) = memo.get(&id.0) {
        return Ok(cached.clone());
    }
    let node = nodes
        .get(id.0 as usize)
        .ok_or_else(|| BackendError::execution(format!("node {:?} missing from graph", id)))?;

    let mut inputs = Vec::with_capacity(node.inputs.len());
    for input in &node.inputs {
        check_primary(nodes, *input)?;
        inputs.push(eval_node(nodes, input.node, memo)?);
    }

    let result = execute(node, &inputs)?;
    memo.insert(id.0, result.clone());
    Ok(result)
}

fn execute(node: &Node, inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    match &node.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::Placeholder => Err(BackendError::execution(format!(
            "placeholder '{}' was not fed",
            node.name
        ))),
        Operation::Unary(op) => unary_kernel(*op, &inputs[0]),
        Operation::Binary(op) => binary_kernel(*op, &inputs[0], &inputs[1]),
        Operation::MatMul(spec) => matmul_kernel(spec, &inputs[0], &inputs[1]),
        Operation::Reduce(spec) => reduce_kernel(spec, &inputs[0]),
        Operation::DiagPart => diag_part_kernel(&inputs[0]),
        Operation::Reshape => reshape_kernel(node, &inputs[0]),
        Operation::BroadcastTo => broadcast_to_kernel(node, &inputs[0]),
        Operation::Slice(spec) => slice_kernel(spec, &inputs[0]),
        Operation::Squeeze(spec) => squeeze_kernel(spec, &inputs[0]),
        Operation::Pack(spec) => pack_kernel(spec, inputs),
        Operation::ExpandDims(spec) => expand_dims_kernel(spec.axis, &inputs[0]),
        Operation::Pad(spec) => pad_kernel(spec, &inputs[0]),
        Operation::Conv2d(spec) => conv2d_kernel(spec, &inputs[0], &inputs[1]),
        Operation::Conv2dBackpropInput(spec) => {
            conv2d_backprop_input_kernel(node, spec, &inputs[0], &inputs[1])
        }
        Operation::RngTruncatedNormal(spec) => rng_kernel(node, spec.seed),
        Operation::Cast(spec) => cast_kernel(spec, &inputs[0]),
        Operation::DecodeJpeg(_) => Err(BackendError::unimplemented(
            "DecodeJpeg",
            "the reference CPU backend carries no image codec",
        )),
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let dims = literal.spec.static_dims().ok_or_else(|| {
        BackendError::spec("materialize", "literal shape must be fully static")
    })?;
    let count: usize = dims.iter().product();
    let bytes = literal.bytes.as_ref();
    let check = |width: usize| -> BackendResult<()> {
        if bytes.len() != count * width {
            return Err(BackendError::spec(
                "materialize",
                format!(
                    "literal byte length {} does not match {} elements of width {}",
                    bytes.len(),
                    count,
                    width
                ),
            ));
        }
        Ok(())
    };
    let data = match literal.spec.dtype {
        DType::F32 => {
            check(4)?;
            TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        DType::F64 => {
            check(8)?;
            TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            )
        }
        DType::I32 => {
            check(4)?;
            TensorData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        DType::I64 => {
            check(8)?;
            TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            )
        }
        DType::Utf8 => {
            if !dims.is_empty() {
                return Err(BackendError::spec(
                    "materialize",
                    "string tensors must be rank 0",
                ));
            }
            TensorData::Bytes(Arc::from(bytes.to_vec().into_boxed_slice()))
        }
    };
    Ok(CpuTensor {
        spec: TensorSpec::from_static(literal.spec.dtype, &dims),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    let bytes: Vec<u8> = match &tensor.data {
        TensorData::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::F64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::I32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::I64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Bytes(values) => values.to_vec(),
    };
    Ok(TensorLiteral::new(
        tensor.spec.clone(),
        Arc::from(bytes.into_boxed_slice()),
    ))
}

fn unary_kernel(op: UnaryOp, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    match &x.data {
        TensorData::F32(values) => {
            let f = float_unary::<f32>(op);
            Ok(CpuTensor::from_f32(dims, values.iter().map(|&v| f(v)).collect()))
        }
        TensorData::F64(values) => {
            let f = float_unary::<f64>(op);
            Ok(CpuTensor::from_f64(dims, values.iter().map(|&v| f(v)).collect()))
        }
        TensorData::I32(values) => {
            let mapped = int_unary(op, values.iter().map(|&v| v as i64))?;
            Ok(CpuTensor::from_i32(
                dims,
                mapped.into_iter().map(|v| v as i32).collect(),
            ))
        }
        TensorData::I64(values) => {
            let mapped = int_unary(op, values.iter().copied())?;
            Ok(CpuTensor::from_i64(dims, mapped))
        }
        TensorData::Bytes(_) => Err(BackendError::execution(
            "elementwise kernels do not accept string tensors",
        )),
    }
}

trait FloatScalar: Copy {
    fn apply(self, op: UnaryOp) -> Self;
}

impl FloatScalar for f32 {
    fn apply(self, op: UnaryOp) -> Self {
        apply_float_unary_f64(self as f64, op) as f32
    }
}

impl FloatScalar for f64 {
    fn apply(self, op: UnaryOp) -> Self {
        apply_float_unary_f64(self, op)
    }
}

fn apply_float_unary_f64(v: f64, op: UnaryOp) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Abs => v.abs(),
        UnaryOp::Sign => {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        UnaryOp::Sin => v.sin(),
        UnaryOp::Cos => v.cos(),
        UnaryOp::Tan => v.tan(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Tanh => v.tanh(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        UnaryOp::Relu => v.max(0.0),
    }
}

fn float_unary<T: FloatScalar>(op: UnaryOp) -> impl Fn(T) -> T {
    move |v| v.apply(op)
}

fn int_unary(op: UnaryOp, values: impl Iterator<Item = i64>) -> BackendResult<Vec<i64>> {
    match op {
        UnaryOp::Neg => Ok(values.map(|v| -v).collect()),
        UnaryOp::Abs => Ok(values.map(|v| v.abs()).collect()),
        UnaryOp::Sign => Ok(values.map(|v| v.signum()).collect()),
        UnaryOp::Relu => Ok(values.map(|v| v.max(0)).collect()),
        other => Err(BackendError::unimplemented(
            "Unary",
            format!("{other:?} over integer tensors"),
        )),
    }
}

fn broadcast_dims(a: &[usize], b: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        if da == db || da == 1 || db == 1 {
            out.push(da.max(db));
        } else {
            return Err(BackendError::execution(format!(
                "shapes {a:?} and {b:?} do not broadcast",
            )));
        }
    }
    Ok(out)
}

/// Row-major strides right-aligned against `out`, with zero stride where the
/// source dimension is stretched.
fn broadcast_strides(dims: &[usize], out: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; out.len()];
    let mut stride = 1usize;
    for i in (0..dims.len()).rev() {
        let out_axis = out.len() - dims.len() + i;
        strides[out_axis] = if dims[i] == 1 { 0 } else { stride };
        stride *= dims[i];
    }
    strides
}

fn broadcast_zip<T: Copy>(
    a: &[T],
    a_dims: &[usize],
    b: &[T],
    b_dims: &[usize],
    f: impl Fn(T, T) -> T,
) -> BackendResult<(Vec<usize>, Vec<T>)> {
    let out_dims = broadcast_dims(a_dims, b_dims)?;
    let count: usize = out_dims.iter().product();
    let a_strides = broadcast_strides(a_dims, &out_dims);
    let b_strides = broadcast_strides(b_dims, &out_dims);
    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; out_dims.len()];
    for _ in 0..count {
        let mut ai = 0;
        let mut bi = 0;
        for (axis, &i) in index.iter().enumerate() {
            ai += i * a_strides[axis];
            bi += i * b_strides[axis];
        }
        out.push(f(a[ai], b[bi]));
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok((out_dims, out))
}

fn binary_kernel(op: BinaryOp, a: &CpuTensor, b: &CpuTensor) -> BackendResult<CpuTensor> {
    let a_dims = a.dims()?;
    let b_dims = b.dims()?;
    match (&a.data, &b.data) {
        (TensorData::F32(x), TensorData::F32(y)) => {
            let f = |l: f32, r: f32| apply_float_binary_f64(l as f64, r as f64, op) as f32;
            let (dims, values) = broadcast_zip(x, &a_dims, y, &b_dims, f)?;
            Ok(CpuTensor::from_f32(dims, values))
        }
        (TensorData::F64(x), TensorData::F64(y)) => {
            let f = |l: f64, r: f64| apply_float_binary_f64(l, r, op);
            let (dims, values) = broadcast_zip(x, &a_dims, y, &b_dims, f)?;
            Ok(CpuTensor::from_f64(dims, values))
        }
        (TensorData::I32(x), TensorData::I32(y)) => {
            let f = int_binary(op)?;
            let (dims, values) = broadcast_zip(
                &x.iter().map(|&v| v as i64).collect::<Vec<_>>(),
                &a_dims,
                &y.iter().map(|&v| v as i64).collect::<Vec<_>>(),
                &b_dims,
                f,
            )?;
            Ok(CpuTensor::from_i32(
                dims,
                values.into_iter().map(|v| v as i32).collect(),
            ))
        }
        (TensorData::I64(x), TensorData::I64(y)) => {
            let f = int_binary(op)?;
            let (dims, values) = broadcast_zip(x, &a_dims, y, &b_dims, f)?;
            Ok(CpuTensor::from_i64(dims, values))
        }
        _ => Err(BackendError::execution(
            "binary kernels require matching numeric dtypes",
        )),
    }
}

fn apply_float_binary_f64(l: f64, r: f64, op: BinaryOp) -> f64 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => l / r,
        BinaryOp::Maximum => l.max(r),
        BinaryOp::Minimum => l.min(r),
        BinaryOp::Pow => l.powf(r),
    }
}

fn int_binary(op: BinaryOp) -> BackendResult<fn(i64, i64) -> i64> {
    Ok(match op {
        BinaryOp::Add => |l, r| l + r,
        BinaryOp::Sub => |l, r| l - r,
        BinaryOp::Mul => |l, r| l * r,
        BinaryOp::Div => |l, r| l / r,
        BinaryOp::Maximum => |l: i64, r: i64| l.max(r),
        BinaryOp::Minimum => |l: i64, r: i64| l.min(r),
        BinaryOp::Pow => {
            return Err(BackendError::unimplemented(
                "Binary",
                "Pow over integer tensors",
            ))
        }
    })
}

fn matmul_kernel(spec: &MatMulSpec, a: &CpuTensor, b: &CpuTensor) -> BackendResult<CpuTensor> {
    let a_dims = a.dims()?;
    let b_dims = b.dims()?;
    if a_dims.len() != 2 || b_dims.len() != 2 {
        return Err(BackendError::execution(format!(
            "matmul requires rank-2 operands, got {a_dims:?} and {b_dims:?}"
        )));
    }
    let (m, k1) = if spec.transpose_a {
        (a_dims[1], a_dims[0])
    } else {
        (a_dims[0], a_dims[1])
    };
    let (k2, n) = if spec.transpose_b {
        (b_dims[1], b_dims[0])
    } else {
        (b_dims[0], b_dims[1])
    };
    if k1 != k2 {
        return Err(BackendError::execution(format!(
            "matmul inner dimensions disagree: {k1} vs {k2}"
        )));
    }

    let a_at = |i: usize, k: usize| -> usize {
        if spec.transpose_a {
            k * a_dims[1] + i
        } else {
            i * a_dims[1] + k
        }
    };
    let b_at = |k: usize, j: usize| -> usize {
        if spec.transpose_b {
            j * b_dims[1] + k
        } else {
            k * b_dims[1] + j
        }
    };

    match (&a.data, &b.data) {
        (TensorData::F32(x), TensorData::F32(y)) => {
            let mut out = vec![0f32; m * n];
            for i in 0..m {
                for k in 0..k1 {
                    let lhs = x[a_at(i, k)];
                    for j in 0..n {
                        out[i * n + j] += lhs * y[b_at(k, j)];
                    }
                }
            }
            Ok(CpuTensor::from_f32(vec![m, n], out))
        }
        (TensorData::F64(x), TensorData::F64(y)) => {
            let mut out = vec![0f64; m * n];
            for i in 0..m {
                for k in 0..k1 {
                    let lhs = x[a_at(i, k)];
                    for j in 0..n {
                        out[i * n + j] += lhs * y[b_at(k, j)];
                    }
                }
            }
            Ok(CpuTensor::from_f64(vec![m, n], out))
        }
        _ => Err(BackendError::unimplemented(
            "MatMul",
            "only f32 and f64 operands are supported",
        )),
    }
}

fn resolve_axes(spec: &ReduceSpec, rank: usize) -> BackendResult<Vec<usize>> {
    match &spec.axes {
        None => Ok((0..rank).collect()),
        Some(axes) => {
            for &axis in axes {
                if axis >= rank {
                    return Err(BackendError::execution(format!(
                        "reduction axis {axis} out of range for rank {rank}"
                    )));
                }
            }
            Ok(axes.clone())
        }
    }
}

fn reduce_kernel(spec: &ReduceSpec, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    let axes = resolve_axes(spec, dims.len())?;
    let out_dims: Vec<usize> = dims
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| {
            if axes.contains(&i) {
                if spec.keep_dims {
                    Some(1)
                } else {
                    None
                }
            } else {
                Some(d)
            }
        })
        .collect();
    let kept_axes: Vec<usize> = (0..dims.len()).filter(|i| !axes.contains(i)).collect();

    // Map each input element onto its output slot.
    let out_count: usize = out_dims.iter().product::<usize>().max(1);
    let mut kept_strides = vec![0usize; dims.len()];
    {
        let mut stride = 1usize;
        for &axis in kept_axes.iter().rev() {
            kept_strides[axis] = stride;
            stride *= dims[axis];
        }
    }

    let reduce_f64 = |values: &mut dyn Iterator<Item = (usize, f64)>| -> Vec<f64> {
        let init = match spec.kind {
            ReduceKind::Sum | ReduceKind::Mean => 0.0,
            ReduceKind::Prod => 1.0,
            ReduceKind::Max => f64::NEG_INFINITY,
            ReduceKind::Min => f64::INFINITY,
        };
        let mut out = vec![init; out_count];
        let mut counts = vec![0usize; out_count];
        for (slot, v) in values {
            counts[slot] += 1;
            match spec.kind {
                ReduceKind::Sum | ReduceKind::Mean => out[slot] += v,
                ReduceKind::Prod => out[slot] *= v,
                ReduceKind::Max => out[slot] = out[slot].max(v),
                ReduceKind::Min => out[slot] = out[slot].min(v),
            }
        }
        if spec.kind == ReduceKind::Mean {
            for (slot, value) in out.iter_mut().enumerate() {
                if counts[slot] > 0 {
                    *value /= counts[slot] as f64;
                }
            }
        }
        out
    };

    let slot_of = |flat: usize| -> usize {
        let mut rest = flat;
        let mut slot = 0usize;
        for axis in (0..dims.len()).rev() {
            let i = rest % dims[axis];
            rest /= dims[axis];
            slot += i * kept_strides[axis];
        }
        slot
    };

    match &x.data {
        TensorData::F32(values) => {
            let mut iter = values
                .iter()
                .enumerate()
                .map(|(flat, &v)| (slot_of(flat), v as f64));
            let out = reduce_f64(&mut iter);
            Ok(CpuTensor::from_f32(
                out_dims,
                out.into_iter().map(|v| v as f32).collect(),
            ))
        }
        TensorData::F64(values) => {
            let mut iter = values
                .iter()
                .enumerate()
                .map(|(flat, &v)| (slot_of(flat), v));
            let out = reduce_f64(&mut iter);
            Ok(CpuTensor::from_f64(out_dims, out))
        }
        TensorData::I32(values) => {
            if spec.kind == ReduceKind::Mean {
                return Err(BackendError::unimplemented(
                    "Reduce",
                    "Mean over integer tensors",
                ));
            }
            let mut iter = values
                .iter()
                .enumerate()
                .map(|(flat, &v)| (slot_of(flat), v as f64));
            let out = reduce_f64(&mut iter);
            Ok(CpuTensor::from_i32(
                out_dims,
                out.into_iter().map(|v| v as i32).collect(),
            ))
        }
        TensorData::I64(values) => {
            if spec.kind == ReduceKind::Mean {
                return Err(BackendError::unimplemented(
                    "Reduce",
                    "Mean over integer tensors",
                ));
            }
            let mut iter = values
                .iter()
                .enumerate()
                .map(|(flat, &v)| (slot_of(flat), v as f64));
            let out = reduce_f64(&mut iter);
            Ok(CpuTensor::from_i64(
                out_dims,
                out.into_iter().map(|v| v as i64).collect(),
            ))
        }
        TensorData::Bytes(_) => Err(BackendError::execution(
            "reductions do not accept string tensors",
        )),
    }
}

fn diag_part_kernel(x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    if dims.len() % 2 != 0 || dims.is_empty() {
        return Err(BackendError::execution(format!(
            "diag_part requires a non-zero even rank, got {dims:?}"
        )));
    }
    let half = dims.len() / 2;
    for i in 0..half {
        if dims[i] != dims[half + i] {
            return Err(BackendError::execution(format!(
                "diag_part halves disagree: {dims:?}"
            )));
        }
    }
    let out_dims = dims[..half].to_vec();
    let strides = {
        let mut s = vec![1usize; dims.len()];
        for i in (0..dims.len() - 1).rev() {
            s[i] = s[i + 1] * dims[i + 1];
        }
        s
    };
    let out_count: usize = out_dims.iter().product();
    let mut flats = Vec::with_capacity(out_count);
    let mut index = vec![0usize; half];
    for _ in 0..out_count {
        let mut flat = 0usize;
        for (axis, &i) in index.iter().enumerate() {
            flat += i * (strides[axis] + strides[half + axis]);
        }
        flats.push(flat);
        for axis in (0..half).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    gather_flats(x, out_dims, &flats)
}

fn gather_flats(
    x: &CpuTensor,
    out_dims: Vec<usize>,
    flats: &[usize],
) -> BackendResult<CpuTensor> {
    Ok(match &x.data {
        TensorData::F32(v) => CpuTensor::from_f32(out_dims, flats.iter().map(|&i| v[i]).collect()),
        TensorData::F64(v) => CpuTensor::from_f64(out_dims, flats.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => CpuTensor::from_i32(out_dims, flats.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => CpuTensor::from_i64(out_dims, flats.iter().map(|&i| v[i]).collect()),
        TensorData::Bytes(_) => {
            return Err(BackendError::execution(
                "gather kernels do not accept string tensors",
            ))
        }
    })
}

fn with_dims(x: &CpuTensor, dims: Vec<usize>) -> CpuTensor {
    CpuTensor {
        spec: TensorSpec::from_static(x.spec.dtype, &dims),
        data: x.data.clone(),
    }
}

fn element_count(x: &CpuTensor) -> usize {
    match &x.data {
        TensorData::F32(v) => v.len(),
        TensorData::F64(v) => v.len(),
        TensorData::I32(v) => v.len(),
        TensorData::I64(v) => v.len(),
        TensorData::Bytes(_) => 1,
    }
}

fn reshape_kernel(node: &Node, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let target = node.spec.static_dims().ok_or_else(|| {
        BackendError::execution(format!(
            "reshape target for '{}' is not fully known at run time",
            node.name
        ))
    })?;
    let count: usize = target.iter().product();
    if count != element_count(x) {
        return Err(BackendError::execution(format!(
            "reshape of '{}' changes element count: {} -> {}",
            node.name,
            element_count(x),
            count
        )));
    }
    Ok(with_dims(x, target))
}

fn broadcast_to_kernel(node: &Node, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let target = node.spec.static_dims().ok_or_else(|| {
        BackendError::execution(format!(
            "broadcast target for '{}' is not fully known at run time",
            node.name
        ))
    })?;
    let dims = x.dims()?;
    if dims.len() > target.len() {
        return Err(BackendError::execution(format!(
            "cannot broadcast {dims:?} to {target:?}"
        )));
    }
    let strides = broadcast_strides(&dims, &target);
    for (i, &d) in dims.iter().enumerate() {
        let t = target[target.len() - dims.len() + i];
        if d != 1 && d != t {
            return Err(BackendError::execution(format!(
                "cannot broadcast {dims:?} to {target:?}"
            )));
        }
    }
    let count: usize = target.iter().product();
    let mut flats = Vec::with_capacity(count);
    let mut index = vec![0usize; target.len()];
    for _ in 0..count {
        let mut flat = 0usize;
        for (axis, &i) in index.iter().enumerate() {
            flat += i * strides[axis];
        }
        flats.push(flat);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < target[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    gather_flats(x, target, &flats)
}

fn slice_kernel(spec: &SliceSpec, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    if spec.starts.len() > dims.len() {
        return Err(BackendError::execution(format!(
            "slice request covers {} axes but input has rank {}",
            spec.starts.len(),
            dims.len()
        )));
    }
    let mut out_dims = dims.clone();
    let mut starts = vec![0usize; dims.len()];
    for (axis, (&start, &size)) in spec.starts.iter().zip(spec.sizes.iter()).enumerate() {
        let size = if size < 0 {
            dims[axis].checked_sub(start).ok_or_else(|| {
                BackendError::execution(format!(
                    "slice start {start} exceeds dimension {} on axis {axis}",
                    dims[axis]
                ))
            })?
        } else {
            size as usize
        };
        if start + size > dims[axis] {
            return Err(BackendError::execution(format!(
                "slice [{start}, {}) exceeds dimension {} on axis {axis}",
                start + size,
                dims[axis]
            )));
        }
        starts[axis] = start;
        out_dims[axis] = size;
    }

    let strides = {
        let mut s = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            s[i] = s[i + 1] * dims[i + 1];
        }
        s
    };
    let count: usize = out_dims.iter().product();
    let mut flats = Vec::with_capacity(count);
    let mut index = vec![0usize; out_dims.len()];
    for _ in 0..count {
        let mut flat = 0usize;
        for (axis, &i) in index.iter().enumerate() {
            flat += (starts[axis] + i) * strides[axis];
        }
        flats.push(flat);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis].max(1) {
                break;
            }
            index[axis] = 0;
        }
    }
    gather_flats(x, out_dims, &flats)
}

fn squeeze_kernel(spec: &SqueezeSpec, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    for &axis in &spec.axes {
        if axis >= dims.len() || dims[axis] != 1 {
            return Err(BackendError::execution(format!(
                "cannot squeeze axis {axis} of {dims:?}"
            )));
        }
    }
    let out_dims: Vec<usize> = dims
        .iter()
        .enumerate()
        .filter(|(i, _)| !spec.axes.contains(i))
        .map(|(_, &d)| d)
        .collect();
    Ok(with_dims(x, out_dims))
}

fn expand_dims_kernel(axis: usize, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let mut dims = x.dims()?;
    if axis > dims.len() {
        return Err(BackendError::execution(format!(
            "expand_dims axis {axis} out of range for {dims:?}"
        )));
    }
    dims.insert(axis, 1);
    Ok(with_dims(x, dims))
}

fn pack_kernel(spec: &PackSpec, inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("pack requires at least one input"))?;
    let dims = first.dims()?;
    if spec.axis > dims.len() {
        return Err(BackendError::execution(format!(
            "pack axis {} out of range for {dims:?}",
            spec.axis
        )));
    }
    let outer: usize = dims[..spec.axis].iter().product();
    let inner: usize = dims[spec.axis..].iter().product();
    let mut out_dims = dims.clone();
    out_dims.insert(spec.axis, inputs.len());

    macro_rules! pack_typed {
        ($variant:ident, $ty:ty, $ctor:ident) => {{
            let mut slices: Vec<&[$ty]> = Vec::with_capacity(inputs.len());
            for input in inputs {
                if input.dims()? != dims {
                    return Err(BackendError::execution(
                        "pack inputs must share one shape".to_string(),
                    ));
                }
                match &input.data {
                    TensorData::$variant(values) => slices.push(values),
                    _ => {
                        return Err(BackendError::execution(
                            "pack inputs must share one dtype".to_string(),
                        ))
                    }
                }
            }
            let mut out: Vec<$ty> = Vec::with_capacity(outer * inputs.len() * inner);
            for o in 0..outer {
                for slice in &slices {
                    out.extend_from_slice(&slice[o * inner..(o + 1) * inner]);
                }
            }
            Ok(CpuTensor::$ctor(out_dims, out))
        }};
    }

    match &first.data {
        TensorData::F32(_) => pack_typed!(F32, f32, from_f32),
        TensorData::F64(_) => pack_typed!(F64, f64, from_f64),
        TensorData::I32(_) => pack_typed!(I32, i32, from_i32),
        TensorData::I64(_) => pack_typed!(I64, i64, from_i64),
        TensorData::Bytes(_) => Err(BackendError::execution(
            "pack does not accept string tensors",
        )),
    }
}

fn pad_kernel(spec: &PadSpec, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    if spec.low.len() != dims.len() || spec.high.len() != dims.len() {
        return Err(BackendError::execution(format!(
            "pad configuration rank {} does not match input rank {}",
            spec.low.len(),
            dims.len()
        )));
    }
    let out_dims: Vec<usize> = dims
        .iter()
        .zip(spec.low.iter().zip(spec.high.iter()))
        .map(|(&d, (&lo, &hi))| d + lo + hi)
        .collect();
    let out_strides = {
        let mut s = vec![1usize; out_dims.len()];
        for i in (0..out_dims.len().saturating_sub(1)).rev() {
            s[i] = s[i + 1] * out_dims[i + 1];
        }
        s
    };
    let in_count: usize = dims.iter().product();
    let out_count: usize = out_dims.iter().product();

    macro_rules! pad_typed {
        ($values:expr, $ty:ty, $ctor:ident) => {{
            let mut out: Vec<$ty> = vec![Default::default(); out_count];
            let mut index = vec![0usize; dims.len()];
            for flat in 0..in_count {
                let mut out_flat = 0usize;
                for (axis, &i) in index.iter().enumerate() {
                    out_flat += (i + spec.low[axis]) * out_strides[axis];
                }
                out[out_flat] = $values[flat];
                for axis in (0..index.len()).rev() {
                    index[axis] += 1;
                    if index[axis] < dims[axis] {
                        break;
                    }
                    index[axis] = 0;
                }
            }
            Ok(CpuTensor::$ctor(out_dims, out))
        }};
    }

    match &x.data {
        TensorData::F32(v) => pad_typed!(v, f32, from_f32),
        TensorData::F64(v) => pad_typed!(v, f64, from_f64),
        TensorData::I32(v) => pad_typed!(v, i32, from_i32),
        TensorData::I64(v) => pad_typed!(v, i64, from_i64),
        TensorData::Bytes(_) => Err(BackendError::execution(
            "pad does not accept string tensors",
        )),
    }
}

/// Padding amounts for one spatial axis under the given scheme.
fn conv_padding(padding: Padding, input: usize, filter: usize, stride: usize) -> (usize, usize) {
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let needed = ((out - 1) * stride + filter).saturating_sub(input);
            (needed / 2, needed - needed / 2)
        }
        Padding::Valid => (0, 0),
    }
}

fn conv_out_extent(padding: Padding, input: usize, filter: usize, stride: usize) -> usize {
    match padding {
        Padding::Same => input.div_ceil(stride),
        Padding::Valid => (input.saturating_sub(filter)) / stride + 1,
    }
}

fn conv2d_kernel(
    spec: &Conv2dSpec,
    x: &CpuTensor,
    filter: &CpuTensor,
) -> BackendResult<CpuTensor> {
    let x_dims = x.dims()?;
    let f_dims = filter.dims()?;
    if x_dims.len() != 4 || f_dims.len() != 4 {
        return Err(BackendError::execution(
            "conv2d requires NHWC input and [F1, F2, Cin, Cout] filter",
        ));
    }
    let (n, h, w, c_in) = (x_dims[0], x_dims[1], x_dims[2], x_dims[3]);
    let (f1, f2, fc_in, c_out) = (f_dims[0], f_dims[1], f_dims[2], f_dims[3]);
    if fc_in != c_in {
        return Err(BackendError::execution(format!(
            "conv2d channel mismatch: input {c_in}, filter {fc_in}"
        )));
    }
    let [sh, sw] = spec.strides;
    let out_h = conv_out_extent(spec.padding, h, f1, sh);
    let out_w = conv_out_extent(spec.padding, w, f2, sw);
    let (pad_top, _) = conv_padding(spec.padding, h, f1, sh);
    let (pad_left, _) = conv_padding(spec.padding, w, f2, sw);

    let xs = x.f32s()?;
    let fs = filter.f32s()?;
    let mut out = vec![0f32; n * out_h * out_w * c_out];
    for b in 0..n {
        for oh in 0..out_h {
            for ow in 0..out_w {
                for fh in 0..f1 {
                    let ih = (oh * sh + fh) as isize - pad_top as isize;
                    if ih < 0 || ih as usize >= h {
                        continue;
                    }
                    for fw in 0..f2 {
                        let iw = (ow * sw + fw) as isize - pad_left as isize;
                        if iw < 0 || iw as usize >= w {
                            continue;
                        }
                        for ic in 0..c_in {
                            let xv = xs[((b * h + ih as usize) * w + iw as usize) * c_in + ic];
                            let f_base = ((fh * f2 + fw) * c_in + ic) * c_out;
                            let o_base = ((b * out_h + oh) * out_w + ow) * c_out;
                            for oc in 0..c_out {
                                out[o_base + oc] += xv * fs[f_base + oc];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(CpuTensor::from_f32(vec![n, out_h, out_w, c_out], out))
}

fn conv2d_backprop_input_kernel(
    node: &Node,
    spec: &Conv2dSpec,
    filter: &CpuTensor,
    out_backprop: &CpuTensor,
) -> BackendResult<CpuTensor> {
    let f_dims = filter.dims()?;
    let g_dims = out_backprop.dims()?;
    if f_dims.len() != 4 || g_dims.len() != 4 {
        return Err(BackendError::execution(
            "conv2d_backprop_input requires a rank-4 filter and gradient",
        ));
    }
    let target = node.spec.static_dims().ok_or_else(|| {
        BackendError::execution(format!(
            "input shape for '{}' is not fully known at run time",
            node.name
        ))
    })?;
    let (n, h, w, c_in) = (target[0], target[1], target[2], target[3]);
    let (f1, f2, fc_in, c_out) = (f_dims[0], f_dims[1], f_dims[2], f_dims[3]);
    if fc_in != c_in || g_dims[3] != c_out || g_dims[0] != n {
        return Err(BackendError::execution(
            "conv2d_backprop_input shapes are inconsistent",
        ));
    }
    let [sh, sw] = spec.strides;
    let (pad_top, _) = conv_padding(spec.padding, h, f1, sh);
    let (pad_left, _) = conv_padding(spec.padding, w, f2, sw);
    let (out_h, out_w) = (g_dims[1], g_dims[2]);

    let fs = filter.f32s()?;
    let gs = out_backprop.f32s()?;
    let mut out = vec![0f32; n * h * w * c_in];
    for b in 0..n {
        for oh in 0..out_h {
            for ow in 0..out_w {
                for fh in 0..f1 {
                    let ih = (oh * sh + fh) as isize - pad_top as isize;
                    if ih < 0 || ih as usize >= h {
                        continue;
                    }
                    for fw in 0..f2 {
                        let iw = (ow * sw + fw) as isize - pad_left as isize;
                        if iw < 0 || iw as usize >= w {
                            continue;
                        }
                        for oc in 0..c_out {
                            let gv = gs[((b * out_h + oh) * out_w + ow) * c_out + oc];
                            let f_base = (fh * f2 + fw) * c_in * c_out + oc;
                            let x_base = ((b * h + ih as usize) * w + iw as usize) * c_in;
                            for ic in 0..c_in {
                                out[x_base + ic] += gv * fs[f_base + ic * c_out];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(CpuTensor::from_f32(vec![n, h, w, c_in], out))
}

fn rng_kernel(node: &Node, seed: Option<u64>) -> BackendResult<CpuTensor> {
    let dims = node.spec.static_dims().ok_or_else(|| {
        BackendError::execution(format!(
            "random shape for '{}' is not fully known at run time",
            node.name
        ))
    })?;
    let count: usize = dims.iter().product();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut sample = || -> f64 {
        // Box-Muller with rejection beyond two standard deviations.
        loop {
            let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.gen::<f64>();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            if z.abs() <= 2.0 {
                return z;
            }
        }
    };
    match node.spec.dtype {
        DType::F32 => Ok(CpuTensor::from_f32(
            dims,
            (0..count).map(|_| sample() as f32).collect(),
        )),
        DType::F64 => Ok(CpuTensor::from_f64(
            dims,
            (0..count).map(|_| sample()).collect(),
        )),
        other => Err(BackendError::unimplemented(
            "TruncatedNormal",
            format!("dtype {other:?}"),
        )),
    }
}

fn cast_kernel(spec: &CastSpec, x: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = x.dims()?;
    let as_f64: Vec<f64> = match &x.data {
        TensorData::F32(v) => v.iter().map(|&v| v as f64).collect(),
        TensorData::F64(v) => v.to_vec(),
        TensorData::I32(v) => v.iter().map(|&v| v as f64).collect(),
        TensorData::I64(v) => v.iter().map(|&v| v as f64).collect(),
        TensorData::Bytes(_) => {
            return Err(BackendError::execution("cannot cast string tensors"))
        }
    };
    match spec.dtype {
        DType::F32 => Ok(CpuTensor::from_f32(
            dims,
            as_f64.into_iter().map(|v| v as f32).collect(),
        )),
        DType::F64 => Ok(CpuTensor::from_f64(dims, as_f64)),
        DType::I32 => Ok(CpuTensor::from_i32(
            dims,
            as_f64.into_iter().map(|v| v as i32).collect(),
        )),
        DType::I64 => Ok(CpuTensor::from_i64(
            dims,
            as_f64.into_iter().map(|v| v as i64).collect(),
        )),
        DType::Utf8 => Err(BackendError::execution("cannot cast to string tensors")),
    }
}
