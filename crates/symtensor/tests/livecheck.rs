//! Live-check mode is process-wide, so it gets its own test binary.

use std::sync::Arc;

use anyhow::Result;
use symtensor::{broadcast_scalar, matrix, set_live_check, vector};
use symtensor_backend_ref_cpu::CpuBackend;

#[test]
fn live_check_returns_placeholders_without_executing() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    set_live_check(true);

    let a = matrix(&[[1.0f32, 2.0], [3.0, 4.0]])?;
    let b = matrix(&[[5.0f32], [6.0]])?;
    let product = a.matmul(&b)?;
    let value = product.get_value(&backend)?;
    assert_eq!(value.dims(), &[2, 1]);
    assert_eq!(value.values::<f32>()?, vec![0.0, 0.0]);

    // Shapes with open dimensions fall back to one; nothing throws.
    let flex = broadcast_scalar(1.0f32);
    let open = flex.get_value(&backend)?;
    assert_eq!(open.dims(), &[] as &[usize]);

    set_live_check(false);
    let real = vector(&[1.0f32, 2.0]).sum().to_scalar(&backend)?;
    assert_eq!(real, 3.0);
    Ok(())
}
