//! Graph-level reverse-mode gradient construction.
//!
//! Given an output node `y`, target nodes `xs`, and an optional incoming
//! gradient `dy`, this appends the gradient subgraph for `d y / d xs` to the
//! graph and returns one node per target. Nodes are visited in reverse
//! insertion order (insertion order is topological), accumulating
//! vector-Jacobian contributions per producer. Only nodes that can reach a
//! target receive contributions, so unsupported operations on irrelevant
//! paths never fail a build.

use std::collections::HashMap;

use crate::backend::graph::Graph;
use crate::backend::spec::{
    BackendError, BackendResult, BinaryOp, CastSpec, Conv2dSpec, Dimension, MatMulSpec, Node,
    NodeId, Operation, Output, PackSpec, PadSpec, ReduceKind, ReduceSpec, SliceSpec, SqueezeSpec,
    TensorLiteral, TensorSpec, UnaryOp,
};

pub fn add_gradients(
    graph: &Graph,
    y: NodeId,
    xs: &[NodeId],
    dy: Option<NodeId>,
) -> BackendResult<Vec<NodeId>> {
    let nodes = graph.nodes();

    // A node is relevant when some target is reachable through its inputs.
    // Insertion order guarantees inputs precede consumers, so one pass works.
    let mut relevant = vec![false; nodes.len()];
    for &x in xs {
        relevant[x.0 as usize] = true;
    }
    for i in 0..nodes.len() {
        if !relevant[i] {
            relevant[i] = nodes[i]
                .inputs
                .iter()
                .any(|input| relevant[input.node.0 as usize]);
        }
    }

    let _scope = graph.scoped("gradients");

    let seed = match dy {
        Some(dy) => Output::new(dy),
        None => splat(graph, &nodes[y.0 as usize].spec, 1.0)?,
    };
    let mut pending: HashMap<u32, Vec<Output>> = HashMap::new();
    pending.insert(y.0, vec![seed]);

    let mut grads: HashMap<u32, Output> = HashMap::new();
    for node in nodes.iter().rev() {
        let Some(contributions) = pending.remove(&node.id.0) else {
            continue;
        };
        let mut total = contributions[0];
        for &extra in &contributions[1..] {
            total = Output::new(graph.add(
                Operation::Binary(BinaryOp::Add),
                vec![total, extra],
                node.spec.clone(),
            ));
        }
        grads.insert(node.id.0, total);

        let mut sink = |input: Output, grad: Output| {
            if relevant[input.node.0 as usize] {
                pending.entry(input.node.0).or_default().push(grad);
            }
        };
        backprop_node(graph, &nodes, node, total, &relevant, &mut sink)?;
    }

    let mut results = Vec::with_capacity(xs.len());
    for &x in xs {
        let output = match grads.get(&x.0) {
            Some(output) => *output,
            None => splat(graph, &nodes[x.0 as usize].spec, 0.0)?,
        };
        results.push(output.node);
    }
    Ok(results)
}

/// Emits the vector-Jacobian products of a single node into `sink`.
fn backprop_node(
    graph: &Graph,
    nodes: &[Node],
    node: &Node,
    g: Output,
    relevant: &[bool],
    sink: &mut dyn FnMut(Output, Output),
) -> BackendResult<()> {
    let in_spec = |index: usize| nodes[node.inputs[index].node.0 as usize].spec.clone();
    let out = Output::new(node.id);

    match &node.op {
        Operation::Constant(_)
        | Operation::Placeholder
        | Operation::RngTruncatedNormal(_)
        | Operation::DecodeJpeg(_) => Ok(()),

        Operation::Binary(op) => {
            let a = node.inputs[0];
            let b = node.inputs[1];
            let a_spec = in_spec(0);
            let b_spec = in_spec(1);
            match op {
                BinaryOp::Add => {
                    sink(a, reduce_like(graph, g, &node.spec, &a_spec));
                    sink(b, reduce_like(graph, g, &node.spec, &b_spec));
                    Ok(())
                }
                BinaryOp::Sub => {
                    sink(a, reduce_like(graph, g, &node.spec, &a_spec));
                    let neg = unary(graph, UnaryOp::Neg, g, &node.spec);
                    sink(b, reduce_like(graph, neg, &node.spec, &b_spec));
                    Ok(())
                }
                BinaryOp::Mul => {
                    let ga = binary(graph, BinaryOp::Mul, g, b, &node.spec);
                    sink(a, reduce_like(graph, ga, &node.spec, &a_spec));
                    let gb = binary(graph, BinaryOp::Mul, g, a, &node.spec);
                    sink(b, reduce_like(graph, gb, &node.spec, &b_spec));
                    Ok(())
                }
                BinaryOp::Div => {
                    let ga = binary(graph, BinaryOp::Div, g, b, &node.spec);
                    sink(a, reduce_like(graph, ga, &node.spec, &a_spec));
                    // -(g * a) / (b * b)
                    let num = binary(graph, BinaryOp::Mul, g, a, &node.spec);
                    let den = binary(graph, BinaryOp::Mul, b, b, &node.spec);
                    let quot = binary(graph, BinaryOp::Div, num, den, &node.spec);
                    let gb = unary(graph, UnaryOp::Neg, quot, &node.spec);
                    sink(b, reduce_like(graph, gb, &node.spec, &b_spec));
                    Ok(())
                }
                BinaryOp::Pow => {
                    let one = splat(graph, &b_spec, 1.0)?;
                    let b_minus_one = binary(graph, BinaryOp::Sub, b, one, &b_spec);
                    let powed = binary(graph, BinaryOp::Pow, a, b_minus_one, &node.spec);
                    let scaled = binary(graph, BinaryOp::Mul, powed, b, &node.spec);
                    let ga = binary(graph, BinaryOp::Mul, g, scaled, &node.spec);
                    sink(a, reduce_like(graph, ga, &node.spec, &a_spec));

                    let log_a = unary(graph, UnaryOp::Log, a, &a_spec);
                    let gb = binary(graph, BinaryOp::Mul, g, out, &node.spec);
                    let gb = binary(graph, BinaryOp::Mul, gb, log_a, &node.spec);
                    sink(b, reduce_like(graph, gb, &node.spec, &b_spec));
                    Ok(())
                }
                BinaryOp::Maximum | BinaryOp::Minimum => Err(BackendError::unimplemented(
                    "gradients",
                    format!("no gradient rule for {}", node.op.type_name()),
                )),
            }
        }

        Operation::Unary(op) => {
            let x = node.inputs[0];
            let grad = match op {
                UnaryOp::Neg => unary(graph, UnaryOp::Neg, g, &node.spec),
                UnaryOp::Abs => {
                    let s = unary(graph, UnaryOp::Sign, x, &node.spec);
                    binary(graph, BinaryOp::Mul, g, s, &node.spec)
                }
                UnaryOp::Sign => splat(graph, &node.spec, 0.0)?,
                UnaryOp::Sin => {
                    let c = unary(graph, UnaryOp::Cos, x, &node.spec);
                    binary(graph, BinaryOp::Mul, g, c, &node.spec)
                }
                UnaryOp::Cos => {
                    let s = unary(graph, UnaryOp::Sin, x, &node.spec);
                    let gs = binary(graph, BinaryOp::Mul, g, s, &node.spec);
                    unary(graph, UnaryOp::Neg, gs, &node.spec)
                }
                UnaryOp::Tan => {
                    let c = unary(graph, UnaryOp::Cos, x, &node.spec);
                    let c2 = binary(graph, BinaryOp::Mul, c, c, &node.spec);
                    binary(graph, BinaryOp::Div, g, c2, &node.spec)
                }
                UnaryOp::Exp => binary(graph, BinaryOp::Mul, g, out, &node.spec),
                UnaryOp::Log => binary(graph, BinaryOp::Div, g, x, &node.spec),
                UnaryOp::Sqrt => {
                    let two = binary(graph, BinaryOp::Add, out, out, &node.spec);
                    binary(graph, BinaryOp::Div, g, two, &node.spec)
                }
                UnaryOp::Tanh => {
                    // g * (1 - out^2)
                    let sq = binary(graph, BinaryOp::Mul, out, out, &node.spec);
                    let gsq = binary(graph, BinaryOp::Mul, g, sq, &node.spec);
                    binary(graph, BinaryOp::Sub, g, gsq, &node.spec)
                }
                UnaryOp::Sigmoid => {
                    // g * out * (1 - out)
                    let go = binary(graph, BinaryOp::Mul, g, out, &node.spec);
                    let goo = binary(graph, BinaryOp::Mul, go, out, &node.spec);
                    binary(graph, BinaryOp::Sub, go, goo, &node.spec)
                }
                UnaryOp::Relu => {
                    let s = unary(graph, UnaryOp::Sign, x, &node.spec);
                    let step = unary(graph, UnaryOp::Relu, s, &node.spec);
                    binary(graph, BinaryOp::Mul, g, step, &node.spec)
                }
            };
            sink(x, grad);
            Ok(())
        }

        Operation::MatMul(spec) => {
            let a = node.inputs[0];
            let b = node.inputs[1];
            let a_spec = in_spec(0);
            let b_spec = in_spec(1);
            let (ga, gb) = match (spec.transpose_a, spec.transpose_b) {
                (false, false) => (
                    matmul(graph, g, b, false, true, &a_spec),
                    matmul(graph, a, g, true, false, &b_spec),
                ),
                (false, true) => (
                    matmul(graph, g, b, false, false, &a_spec),
                    matmul(graph, g, a, true, false, &b_spec),
                ),
                (true, false) => (
                    matmul(graph, b, g, false, true, &a_spec),
                    matmul(graph, a, g, false, false, &b_spec),
                ),
                (true, true) => (
                    matmul(graph, b, g, true, true, &a_spec),
                    matmul(graph, g, a, true, true, &b_spec),
                ),
            };
            sink(a, ga);
            sink(b, gb);
            Ok(())
        }

        Operation::Reduce(spec) => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            match spec.kind {
                ReduceKind::Sum | ReduceKind::Mean => {
                    let expanded = broadcast_back(graph, g, &node.spec, &x_spec, spec)?;
                    let grad = if spec.kind == ReduceKind::Mean {
                        let count = reduced_count(&x_spec, spec).ok_or_else(|| {
                            BackendError::unimplemented(
                                "gradients",
                                "mean gradient requires static input dimensions",
                            )
                        })?;
                        let scale =
                            splat(graph, &TensorSpec::new(x_spec.dtype, Vec::new()), count as f64)?;
                        binary(graph, BinaryOp::Div, expanded, scale, &x_spec)
                    } else {
                        expanded
                    };
                    sink(x, grad);
                    Ok(())
                }
                ReduceKind::Prod | ReduceKind::Max | ReduceKind::Min => {
                    Err(BackendError::unimplemented(
                        "gradients",
                        format!("no gradient rule for {}", node.op.type_name()),
                    ))
                }
            }
        }

        Operation::Reshape | Operation::ExpandDims(_) | Operation::Squeeze(_) => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            sink(x, reshape(graph, g, &x_spec)?);
            Ok(())
        }

        Operation::BroadcastTo => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            sink(x, reduce_like(graph, g, &node.spec, &x_spec));
            Ok(())
        }

        Operation::Pack(PackSpec { axis }) => {
            let rank = node.spec.rank();
            for (i, &input) in node.inputs.iter().enumerate() {
                let mut starts = vec![0usize; rank];
                let mut sizes = vec![-1i64; rank];
                starts[*axis] = i;
                sizes[*axis] = 1;
                let mut sliced_dims = node.spec.dims.clone();
                sliced_dims[*axis] = Dimension::Static(1);
                let sliced = Output::new(graph.add(
                    Operation::Slice(SliceSpec { starts, sizes }),
                    vec![g],
                    TensorSpec::new(node.spec.dtype, sliced_dims),
                ));
                let squeezed = Output::new(graph.add(
                    Operation::Squeeze(SqueezeSpec { axes: vec![*axis] }),
                    vec![sliced],
                    nodes[input.node.0 as usize].spec.clone(),
                ));
                sink(input, squeezed);
            }
            Ok(())
        }

        Operation::Slice(spec) => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            let dims = x_spec.static_dims().ok_or_else(|| {
                BackendError::unimplemented(
                    "gradients",
                    "slice gradient requires static input dimensions",
                )
            })?;
            let mut low = vec![0usize; dims.len()];
            let mut high = vec![0usize; dims.len()];
            for (axis, (&start, &size)) in spec.starts.iter().zip(spec.sizes.iter()).enumerate() {
                let size = if size < 0 {
                    dims[axis] - start
                } else {
                    size as usize
                };
                low[axis] = start;
                high[axis] = dims[axis] - start - size;
            }
            let padded = Output::new(graph.add(
                Operation::Pad(PadSpec { low, high }),
                vec![g],
                x_spec,
            ));
            sink(x, padded);
            Ok(())
        }

        Operation::Pad(spec) => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            let dims = x_spec.static_dims().ok_or_else(|| {
                BackendError::unimplemented(
                    "gradients",
                    "pad gradient requires static input dimensions",
                )
            })?;
            let starts = spec.low.clone();
            let sizes = dims.iter().map(|&d| d as i64).collect();
            let sliced = Output::new(graph.add(
                Operation::Slice(SliceSpec { starts, sizes }),
                vec![g],
                x_spec,
            ));
            sink(x, sliced);
            Ok(())
        }

        Operation::Conv2d(spec) => {
            let x = node.inputs[0];
            let filter = node.inputs[1];
            // The backend contract only carries the input gradient; a filter
            // gradient request must fail loudly rather than silently vanish.
            if relevant[filter.node.0 as usize] {
                return Err(BackendError::unimplemented(
                    "gradients",
                    "Conv2D has no filter gradient in the backend contract",
                ));
            }
            let x_spec = in_spec(0);
            let grad = Output::new(graph.add(
                Operation::Conv2dBackpropInput(Conv2dSpec {
                    strides: spec.strides,
                    padding: spec.padding,
                }),
                vec![filter, g],
                x_spec,
            ));
            sink(x, grad);
            Ok(())
        }

        Operation::Conv2dBackpropInput(_) | Operation::DiagPart => {
            Err(BackendError::unimplemented(
                "gradients",
                format!("no gradient rule for {}", node.op.type_name()),
            ))
        }

        Operation::Cast(CastSpec { dtype }) => {
            let x = node.inputs[0];
            let x_spec = in_spec(0);
            if dtype.is_float() && x_spec.dtype.is_float() {
                let back = Output::new(graph.add(
                    Operation::Cast(CastSpec {
                        dtype: x_spec.dtype,
                    }),
                    vec![g],
                    x_spec.clone(),
                ));
                sink(x, back);
            }
            Ok(())
        }
    }
}

fn unary(graph: &Graph, op: UnaryOp, input: Output, spec: &TensorSpec) -> Output {
    Output::new(graph.add(Operation::Unary(op), vec![input], spec.clone()))
}

fn binary(graph: &Graph, op: BinaryOp, a: Output, b: Output, spec: &TensorSpec) -> Output {
    Output::new(graph.add(Operation::Binary(op), vec![a, b], spec.clone()))
}

fn matmul(
    graph: &Graph,
    a: Output,
    b: Output,
    transpose_a: bool,
    transpose_b: bool,
    spec: &TensorSpec,
) -> Output {
    Output::new(graph.add(
        Operation::MatMul(MatMulSpec {
            transpose_a,
            transpose_b,
        }),
        vec![a, b],
        spec.clone(),
    ))
}

fn reshape(graph: &Graph, input: Output, spec: &TensorSpec) -> BackendResult<Output> {
    Ok(Output::new(graph.add(
        Operation::Reshape,
        vec![input],
        spec.clone(),
    )))
}

fn splat(graph: &Graph, spec: &TensorSpec, value: f64) -> BackendResult<Output> {
    let literal = TensorLiteral::splat(spec.clone(), value).ok_or_else(|| {
        BackendError::unimplemented(
            "gradients",
            format!("cannot seed a gradient for a non-static shape {:?}", spec.dims),
        )
    })?;
    Ok(Output::new(graph.add(
        Operation::Constant(literal),
        Vec::new(),
        spec.clone(),
    )))
}

/// Sums `g` down to `target`'s shape after pointwise broadcasting: leading
/// broadcast axes are reduced away, stretched unit axes are summed back.
/// Shapes with dynamic dimensions pass through unchanged.
fn reduce_like(graph: &Graph, g: Output, from: &TensorSpec, to: &TensorSpec) -> Output {
    if from.dims == to.dims {
        return g;
    }
    let (Some(from_dims), Some(to_dims)) = (from.static_dims(), to.static_dims()) else {
        return g;
    };
    if from_dims.len() < to_dims.len() {
        return g;
    }
    let offset = from_dims.len() - to_dims.len();
    let mut axes: Vec<usize> = (0..offset).collect();
    for (j, &target) in to_dims.iter().enumerate() {
        if target == 1 && from_dims[offset + j] != 1 {
            axes.push(offset + j);
        }
    }
    if axes.is_empty() && from_dims == to_dims {
        return g;
    }
    let mut current = g;
    if !axes.is_empty() {
        let kept: Vec<Dimension> = from_dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| Dimension::Static(d))
            .collect();
        current = Output::new(graph.add(
            Operation::Reduce(ReduceSpec {
                kind: ReduceKind::Sum,
                axes: Some(axes),
                keep_dims: false,
            }),
            vec![current],
            TensorSpec::new(from.dtype, kept),
        ));
    }
    Output::new(graph.add(Operation::Reshape, vec![current], to.clone()))
}

/// Expands a reduction gradient back to the input shape: restore the reduced
/// axes as units (unless `keep_dims` already did), then broadcast.
fn broadcast_back(
    graph: &Graph,
    g: Output,
    g_spec: &TensorSpec,
    input: &TensorSpec,
    reduce: &ReduceSpec,
) -> BackendResult<Output> {
    let dims = input.static_dims().ok_or_else(|| {
        BackendError::unimplemented(
            "gradients",
            "reduction gradient requires static input dimensions",
        )
    })?;
    let with_units: Vec<Dimension> = match (&reduce.axes, reduce.keep_dims) {
        (_, true) => g_spec.dims.clone(),
        (None, false) => dims.iter().map(|_| Dimension::Static(1)).collect(),
        (Some(axes), false) => dims
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                if axes.contains(&i) {
                    Dimension::Static(1)
                } else {
                    Dimension::Static(d)
                }
            })
            .collect(),
    };
    let reshaped = Output::new(graph.add(
        Operation::Reshape,
        vec![g],
        TensorSpec::new(input.dtype, with_units),
    ));
    Ok(Output::new(graph.add(
        Operation::BroadcastTo,
        vec![reshaped],
        input.clone(),
    )))
}

fn reduced_count(input: &TensorSpec, reduce: &ReduceSpec) -> Option<usize> {
    let dims = input.static_dims()?;
    Some(match &reduce.axes {
        None => dims.iter().product(),
        Some(axes) => axes.iter().map(|&a| dims[a]).product(),
    })
}
