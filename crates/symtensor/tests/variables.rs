use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use symtensor::{eval_with_weights, scalar, variable, vector};
use symtensor_backend_ref_cpu::CpuBackend;

#[test]
fn variables_fall_back_to_their_initializer() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let w = variable(&vector(&[1.0f32, 2.0]), "weights/w0");
    assert_eq!(w.cost(), 100);
    assert_eq!(w.to_array(&backend)?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn bound_weights_replace_the_initializer() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let w = variable(&vector(&[1.0f32, 2.0]), "weights/w0");
    let y = &w + &w;

    let mut weights = HashMap::new();
    weights.insert(
        "weights/w0".to_string(),
        vector(&[10.0f32, 20.0]).erase(),
    );
    let value = eval_with_weights(&backend, &y, weights)?;
    assert_eq!(value.values::<f32>()?, vec![20.0, 40.0]);
    Ok(())
}

#[test]
fn mismatched_weight_dtypes_fall_back_with_a_diagnostic() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let w = variable(&scalar(1.5f32), "weights/bias");
    let mut weights = HashMap::new();
    weights.insert("weights/bias".to_string(), scalar(7i32).erase());
    let value = eval_with_weights(&backend, &w, weights)?;
    assert_eq!(value.scalar::<f32>()?, 1.5);
    Ok(())
}
