use std::sync::Arc;

use anyhow::Result;
use symtensor::{
    curl, diff, diff_n, divergence, grad, gradients, hessian, jacobian, laplacian, matrix,
    scalar, stack, vector, Shape, SliceIndex,
};
use symtensor_backend_ref_cpu::CpuBackend;

fn backend() -> Arc<CpuBackend> {
    Arc::new(CpuBackend::new())
}

#[test]
fn gradient_of_sum_of_squares() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let y = x.try_mul(&x)?.sum();
    let g = grad(&y, &x)?;
    assert_eq!(g.to_array(&backend)?, vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn gradient_shape_matches_target_shape() -> Result<()> {
    let x = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let y = x.try_mul(&x)?.sum();
    let grads = gradients(&y, &[x.clone()])?;
    assert!(Shape::unify("test", grads[0].shape(), x.shape()).is_ok());
    assert_eq!(grads[0].cost(), 100);
    Ok(())
}

#[test]
fn gradients_require_a_scalar_output() {
    let x = vector(&[1.0f32, 2.0]);
    let y = x.try_mul(&x).unwrap();
    assert!(gradients(&y, &[x]).is_err());
}

#[test]
fn gradient_flows_through_matmul() -> Result<()> {
    let backend = backend();
    let a = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let b = matrix(&[[1.0f32], [1.0]])?;
    let y = a.matmul(&b)?.sum();
    let g = grad(&y, &a)?;
    // d(sum(a.b))/da = ones . b^T
    assert_eq!(
        g.to_array_2d(&backend)?,
        vec![vec![1.0, 1.0], vec![1.0, 1.0]]
    );
    Ok(())
}

#[test]
fn gradient_of_mean() -> Result<()> {
    let backend = backend();
    let x = vector(&[2.0f32, 4.0, 6.0, 8.0]);
    let y = x.mean();
    let g = grad(&y, &x)?;
    assert_eq!(g.to_array(&backend)?, vec![0.25, 0.25, 0.25, 0.25]);
    Ok(())
}

#[test]
fn gradient_of_transcendentals() -> Result<()> {
    let backend = backend();
    let x = scalar(0.0f32);
    let y = x.exp().try_add(&x.sin())?;
    let g = grad(&y, &x)?;
    // e^0 + cos(0) = 2
    assert!((g.to_scalar(&backend)? - 2.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn relu_gates_its_gradient() -> Result<()> {
    let backend = backend();
    let x = vector(&[-1.0f32, 3.0]);
    let y = x.relu().sum();
    let g = grad(&y, &x)?;
    assert_eq!(g.to_array(&backend)?, vec![0.0, 1.0]);
    Ok(())
}

#[test]
fn unreached_targets_get_zero_gradients() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let unused = vector(&[5.0f32, 6.0]);
    let y = x.sum();
    let grads = gradients(&y, &[x, unused])?;
    assert_eq!(grads[1].to_array(&backend)?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn first_derivative_of_a_square() -> Result<()> {
    let backend = backend();
    let x = scalar(3.0f32);
    let d = diff(|x| x * x, &x)?;
    assert_eq!(d.to_scalar(&backend)?, 6.0);
    Ok(())
}

#[test]
fn higher_derivatives_of_a_cubic() -> Result<()> {
    let backend = backend();
    let x = scalar(2.0f32);
    let cube = |x: &symtensor::Expr<f32>| x * x * x;
    // d2(x^3)/dx2 = 6x
    let second = diff_n(2, cube, &x)?;
    assert_eq!(second.to_scalar(&backend)?, 12.0);
    let third = diff_n(3, cube, &x)?;
    assert_eq!(third.to_scalar(&backend)?, 6.0);
    Ok(())
}

#[test]
fn jacobian_of_elementwise_square_is_diagonal() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let j = jacobian(|x| x * x, &x)?;
    assert_eq!(j.shape().to_string(), "[2x2]");
    assert_eq!(
        j.to_array_2d(&backend)?,
        vec![vec![2.0, 0.0], vec![0.0, 4.0]]
    );
    Ok(())
}

#[test]
fn hessian_of_sum_of_squares_is_twice_identity() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let h = hessian(|x| (x * x).sum(), &x)?;
    assert_eq!(
        h.to_array_2d(&backend)?,
        vec![vec![2.0, 0.0], vec![0.0, 2.0]]
    );
    Ok(())
}

#[test]
fn laplacian_of_sum_of_squares() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let l = laplacian(|x| (x * x).sum(), &x)?;
    assert_eq!(l.to_scalar(&backend)?, 4.0);
    Ok(())
}

#[test]
fn divergence_of_elementwise_square() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0]);
    let d = divergence(|x| x * x, &x)?;
    // sum_i d(x_i^2)/dx_i = 2 + 4
    assert_eq!(d.to_scalar(&backend)?, 6.0);
    Ok(())
}

#[test]
fn curl_of_a_rotated_field() -> Result<()> {
    let backend = backend();
    let x = vector(&[1.0f32, 2.0, 3.0]);
    // F(x, y, z) = (z, x, y) has curl (1, 1, 1).
    let field = |v: &symtensor::Expr<f32>| {
        let x0 = v.slice(&[SliceIndex::Single(0)]).unwrap();
        let x1 = v.slice(&[SliceIndex::Single(1)]).unwrap();
        let x2 = v.slice(&[SliceIndex::Single(2)]).unwrap();
        stack(&[x2, x0, x1], 0).unwrap()
    };
    let c = curl(field, &x)?;
    assert_eq!(c.to_array(&backend)?, vec![1.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn gradient_subgraphs_are_memoized_per_run() -> Result<()> {
    let x = vector(&[1.0f32, 2.0]);
    let y = x.try_mul(&x)?.sum();
    let grads_a = gradients(&y, &[x.clone()])?;
    let grads_b = gradients(&y, &[x.clone()])?;

    let mut lowering = symtensor::ops::Lowering::new();
    let na = lowering.lower(&grads_a[0])?;
    let len_after_first = lowering.graph().len();
    let nb = lowering.lower(&grads_b[0])?;
    // Same structural key (y, xs, dy): the second façade call reuses the
    // memoized gradient subgraph instead of growing the graph.
    assert_eq!(na, nb);
    assert_eq!(lowering.graph().len(), len_after_first);
    Ok(())
}
