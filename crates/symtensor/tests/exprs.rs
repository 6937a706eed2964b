use std::sync::Arc;

use anyhow::Result;
use symtensor::ops::Lowering;
use symtensor::tensor::bytes;
use symtensor::{
    decode_jpeg, matrix, placeholder, scalar, broadcast_scalar, tensor4, truncated_normal,
    vector, Padding, Shape, SliceIndex,
};
use symtensor_backend_ref_cpu::CpuBackend;

fn backend() -> Arc<CpuBackend> {
    Arc::new(CpuBackend::new())
}

#[test]
fn matmul_computes_product() -> Result<()> {
    let backend = backend();
    let a = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let b = matrix(&[[5.0f32], [6.0]])?;
    let c = a.matmul(&b)?;
    assert_eq!(c.shape().to_string(), "[2x1]");
    assert_eq!(c.to_array_2d(&backend)?, vec![vec![17.0], vec![39.0]]);
    Ok(())
}

#[test]
fn matmul_rejects_mismatched_inner_dims() -> Result<()> {
    let a = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let b = matrix(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]])?;
    assert!(a.matmul(&b).is_err());
    Ok(())
}

#[test]
fn sum_reduces_to_scalar() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.0f32, 2.0, 3.0, 4.0]);
    assert_eq!(v.sum().to_scalar(&backend)?, 10.0);
    Ok(())
}

#[test]
fn axis_sum_drops_the_reduced_axis() -> Result<()> {
    let backend = backend();
    let m = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let columns = m.reduce_sum(Some(&[0]), false)?;
    assert_eq!(columns.shape().to_string(), "[2]");
    assert_eq!(columns.to_array(&backend)?, vec![4.0, 6.0]);
    Ok(())
}

#[test]
fn keep_dims_preserves_rank() -> Result<()> {
    let backend = backend();
    let m = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let kept = m.reduce_sum(Some(&[1]), true)?;
    assert_eq!(kept.shape().to_string(), "[2x1]");
    assert_eq!(kept.to_array_2d(&backend)?, vec![vec![3.0], vec![7.0]]);
    Ok(())
}

#[test]
fn flex_scalar_broadcasts_against_a_vector() -> Result<()> {
    let backend = backend();
    let a = broadcast_scalar(3.0f32);
    let b = vector(&[1.0f32, 2.0, 3.0]);
    let sum = &a + &b;
    // Unification solved the flex tail of `a` during construction.
    assert_eq!(a.shape().dims().len(), 1);
    assert_eq!(sum.to_array(&backend)?, vec![4.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn closed_scalar_does_not_broadcast() {
    let a = scalar(3.0f32);
    let b = vector(&[1.0f32, 2.0, 3.0]);
    assert!(a.try_add(&b).is_err());
}

#[test]
fn conv2d_infers_strided_output_shape() -> Result<()> {
    let x = placeholder::<f32>(Shape::known(&[1, 8, 8, 3]));
    let filter = placeholder::<f32>(Shape::known(&[3, 3, 3, 16]));
    let y = x.conv2d(&filter, 2, Padding::Same)?;
    assert_eq!(y.shape().to_string(), "[1x4x4x16]");
    Ok(())
}

#[test]
fn conv2d_unifies_channels_through_the_filter() -> Result<()> {
    let x = placeholder::<f32>(Shape::known(&[1, 8, 8, 3]));
    let filter = placeholder::<f32>(Shape::known(&[3, 3, 4, 16]));
    assert!(x.conv2d(&filter, 2, Padding::Same).is_err());
    Ok(())
}

#[test]
fn conv2d_executes_identity_kernel() -> Result<()> {
    let backend = backend();
    let x = tensor4(&[[[[1.0f32], [2.0]], [[3.0], [4.0]]]])?;
    let filter = tensor4(&[[[[1.0f32]]]])?;
    let y = x.conv2d(&filter, 1, Padding::Same)?;
    assert_eq!(
        y.to_array_4d(&backend)?,
        vec![vec![vec![vec![1.0], vec![2.0]], vec![vec![3.0], vec![4.0]]]]
    );
    Ok(())
}

#[test]
fn cost_is_monotonic_over_operators() -> Result<()> {
    let a = vector(&[1.0f32, 2.0]);
    let b = vector(&[3.0f32, 4.0]);
    assert_eq!(a.cost(), 0);
    let sum = a.try_add(&b)?;
    assert_eq!(sum.cost(), 1);
    let product = sum.try_mul(&a)?;
    assert!(product.cost() > sum.cost().max(a.cost()));
    Ok(())
}

#[test]
fn constants_round_trip_bytewise() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.5f32, -2.25, 0.0]);
    let literal = v.literal_value().expect("vector is a constant");
    let evaluated = v.get_value(&backend)?;
    assert_eq!(evaluated.bytes(), literal.bytes());
    assert_eq!(evaluated.dims(), literal.dims());
    Ok(())
}

#[test]
fn lowering_memoizes_by_identity() -> Result<()> {
    let x = vector(&[1.0f32, 2.0]);
    let y = &x + &x;
    let z = y.try_mul(&y)?;
    let mut lowering = Lowering::new();
    let first = lowering.lower(&z)?;
    let second = lowering.lower(&z)?;
    assert_eq!(first, second);
    // One constant, one add, one mul: the diamond over `y` lowers once.
    assert_eq!(lowering.graph().len(), 3);
    Ok(())
}

#[test]
fn structurally_equal_constants_are_distinct_nodes() -> Result<()> {
    let a = scalar(1.0f32);
    let b = scalar(1.0f32);
    assert_ne!(a.id(), b.id());
    let sum = a.try_add(&b)?;
    let mut lowering = Lowering::new();
    lowering.lower(&sum)?;
    // Two constant nodes plus the add: memoization is by identity, not value.
    assert_eq!(lowering.graph().len(), 3);
    Ok(())
}

#[test]
fn diag_part_requires_even_rank() -> Result<()> {
    let cube = placeholder::<f32>(Shape::known(&[2, 2, 2]));
    assert!(cube.diag_part().is_err());

    let backend = backend();
    let m = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    assert_eq!(m.diag_part()?.to_array(&backend)?, vec![1.0, 4.0]);
    Ok(())
}

#[test]
fn slice_with_open_endpoint_infers_length() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.0f32, 2.0, 3.0, 4.0]);
    let tail = v.slice(&[SliceIndex::Range { start: 1, end: -1 }])?;
    assert_eq!(tail.shape().to_string(), "[?]");
    assert_eq!(tail.to_array(&backend)?, vec![2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn slice_single_squeezes_the_axis() -> Result<()> {
    let backend = backend();
    let m = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let row = m.slice(&[SliceIndex::Single(1)])?;
    assert_eq!(row.shape().to_string(), "[2]");
    assert_eq!(row.to_array(&backend)?, vec![3.0, 4.0]);
    Ok(())
}

#[test]
fn stack_inserts_the_new_axis() -> Result<()> {
    let backend = backend();
    let a = vector(&[1.0f32, 2.0]);
    let b = vector(&[3.0f32, 4.0]);
    let stacked = symtensor::stack(&[a, b], 0)?;
    assert_eq!(stacked.shape().to_string(), "[2x2]");
    assert_eq!(
        stacked.to_array_2d(&backend)?,
        vec![vec![1.0, 2.0], vec![3.0, 4.0]]
    );
    Ok(())
}

#[test]
fn expand_dims_fills_from_downstream_broadcast() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.0f32, 2.0]);
    let expanded = v.expand_dims(1)?;
    assert_eq!(expanded.shape().to_string(), "[2x?]");
    let m = matrix(&[[10.0f32, 20.0], [30.0, 40.0]])?;
    let sum = expanded.try_add(&m)?;
    assert_eq!(expanded.shape().to_string(), "[2x2]");
    assert_eq!(
        sum.to_array_2d(&backend)?,
        vec![vec![11.0, 21.0], vec![32.0, 42.0]]
    );
    Ok(())
}

#[test]
fn moments_compute_mean_and_variance_in_one_run() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.0f32, 2.0, 3.0, 4.0]);
    let (mean, variance) = v.moments(None, false)?;
    let (m, var) = symtensor::eval2(&backend, &mean, &variance)?;
    assert_eq!(m.scalar::<f32>()?, 2.5);
    assert_eq!(var.scalar::<f32>()?, 1.25);
    Ok(())
}

#[test]
fn truncated_normal_stays_within_two_sigma() -> Result<()> {
    let backend = backend();
    let sample = symtensor::ops::truncated_normal_seeded::<f32>(Shape::known(&[4, 8]), Some(7));
    let values = sample.get_value(&backend)?;
    assert_eq!(values.dims(), &[4, 8]);
    for v in values.values::<f32>()? {
        assert!(v.abs() <= 2.0, "sample {v} escaped the truncation bound");
    }
    let again = symtensor::ops::truncated_normal_seeded::<f32>(Shape::known(&[4, 8]), Some(7));
    assert_eq!(again.get_value(&backend)?.bytes(), values.bytes());
    Ok(())
}

#[test]
fn cast_changes_element_type() -> Result<()> {
    let backend = backend();
    let v = vector(&[1.9f32, -2.9]);
    let ints = v.cast::<i32>();
    assert_eq!(ints.to_array(&backend)?, vec![1, -2]);
    Ok(())
}

#[test]
fn decode_jpeg_checks_shapes_and_reports_missing_codec() -> Result<()> {
    let backend = backend();
    let payload = bytes(vec![0xFF, 0xD8, 0xFF]);
    let img = decode_jpeg(&payload, 3)?;
    assert_eq!(img.shape().to_string(), "[?x?x3]");
    let err = img.get_value(&backend).unwrap_err();
    assert!(err.to_string().contains("not implemented"));

    let not_scalar = placeholder::<symtensor::Utf8>(Shape::known(&[2]));
    assert!(decode_jpeg(&not_scalar, 3).is_err());
    Ok(())
}

#[test]
fn batch_stacks_along_a_leading_axis() -> Result<()> {
    let backend = backend();
    let frames = symtensor::batch(&[symtensor::pixel([1.0f32, 2.0, 3.0]), symtensor::pixel([4.0, 5.0, 6.0])])?;
    assert_eq!(frames.shape().to_string(), "[2x3]");
    assert_eq!(
        frames.to_array_2d(&backend)?,
        vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]
    );
    Ok(())
}

#[test]
fn jagged_matrix_is_rejected() {
    let rows: Vec<Vec<f32>> = vec![vec![1.0, 2.0], vec![3.0]];
    assert!(matrix(&rows).is_err());
}

#[test]
fn unused_truncated_normal_with_open_shape_fails_at_run() {
    let backend = backend();
    let open = truncated_normal::<f32>(Shape::inferred(2));
    assert!(open.get_value(&backend).is_err());
}
