//! Dense host-side tensors used for constant payloads and run results.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use crate::backend::spec::{TensorLiteral, TensorSpec};
use crate::tensor::dtype::{DType, HostScalar};
use crate::tensor::shape::Shape;

/// A host-owned tensor: shape, dtype, and a raw little-endian byte payload.
///
/// Rank-0 `Utf8` tensors carry the string bytes directly.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dims: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl HostTensor {
    /// Builds a tensor from typed values, validating length against shape.
    pub fn from_values<T: HostScalar>(dims: Vec<usize>, values: &[T]) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if values.len() != expected {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                values.len(),
                dims
            );
        }
        Ok(HostTensor {
            dims,
            dtype: T::DTYPE,
            data: T::to_le_bytes_vec(values),
        })
    }

    /// A rank-0 string tensor holding raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        HostTensor {
            dims: Vec::new(),
            dtype: DType::Utf8,
            data: bytes,
        }
    }

    /// A zero-filled tensor of the given dtype and shape.
    pub fn zeros(dtype: DType, dims: Vec<usize>) -> Self {
        let len = match dtype.size_in_bytes() {
            Some(width) => dims.iter().product::<usize>() * width,
            None => 0,
        };
        HostTensor {
            dims,
            dtype,
            data: vec![0u8; len],
        }
    }

    /// A zeroed placeholder for the declared symbolic shape; open dimensions
    /// fall back to one. Used by live-check mode.
    pub fn placeholder(shape: &Shape, dtype: DType) -> Self {
        let dims = shape
            .dims()
            .iter()
            .map(|d| d.value().unwrap_or(1))
            .collect();
        HostTensor::zeros(dtype, dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the payload as typed values, validating the dtype.
    pub fn values<T: HostScalar>(&self) -> Result<Vec<T>> {
        ensure!(
            self.dtype == T::DTYPE,
            "tensor holds {:?} data, not {:?}",
            self.dtype,
            T::DTYPE
        );
        T::from_le_bytes_vec(&self.data)
            .ok_or_else(|| anyhow::anyhow!("payload length {} is misaligned", self.data.len()))
    }

    /// The single element of a rank-0 tensor.
    pub fn scalar<T: HostScalar>(&self) -> Result<T> {
        ensure!(
            self.dims.is_empty(),
            "expected a scalar, got shape {:?}",
            self.dims
        );
        let values = self.values::<T>()?;
        Ok(values[0])
    }

    /// Row-major rows of a rank-2 tensor.
    pub fn rows<T: HostScalar>(&self) -> Result<Vec<Vec<T>>> {
        ensure!(self.rank() == 2, "expected rank 2, got shape {:?}", self.dims);
        let values = self.values::<T>()?;
        let cols = self.dims[1];
        Ok(values.chunks(cols).map(|row| row.to_vec()).collect())
    }

    /// Wraps the payload in a backend-neutral literal.
    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(
            TensorSpec::from_static(self.dtype, &self.dims),
            Arc::from(self.data.clone().into_boxed_slice()),
        )
    }

    /// Reconstructs a host tensor from a backend literal.
    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        let dims = match literal.spec.static_dims() {
            Some(dims) => dims,
            None => bail!("backend produced a literal with dynamic dimensions"),
        };
        if let Some(width) = literal.spec.dtype.size_in_bytes() {
            let expected = dims.iter().product::<usize>() * width;
            ensure!(
                literal.bytes.len() == expected,
                "literal byte length {} does not match expected {}",
                literal.bytes.len(),
                expected
            );
        }
        Ok(HostTensor {
            dims,
            dtype: literal.spec.dtype,
            data: literal.bytes.as_ref().to_vec(),
        })
    }
}
