pub mod cpu;

pub use cpu::{CpuBackend, CpuPartialRun, CpuTensor, TensorData};
