//! Scalar element types carried by expressions and backend tensors.

use serde::{Deserialize, Serialize};

/// Runtime dtype identifier shared between the expression layer and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    /// UTF-8 byte string; only rank-0 payloads are supported.
    Utf8,
}

impl DType {
    /// Bytes per scalar element, when storage size is well-defined.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::F32 | DType::I32 => Some(4),
            DType::F64 | DType::I64 => Some(8),
            DType::Utf8 => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }
}

/// Marker for UTF-8 string expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for super::Utf8 {}
}

/// Phantom element tag attached to every expression.
pub trait Element: sealed::Sealed + 'static {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}
impl Element for f64 {
    const DTYPE: DType = DType::F64;
}
impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
impl Element for i64 {
    const DTYPE: DType = DType::I64;
}
impl Element for Utf8 {
    const DTYPE: DType = DType::Utf8;
}

/// Element types with arithmetic semantics.
pub trait NumericElement: Element {}
impl NumericElement for f32 {}
impl NumericElement for f64 {}
impl NumericElement for i32 {}
impl NumericElement for i64 {}

/// Element types with floating-point semantics (differentiable).
pub trait FloatElement: NumericElement {}
impl FloatElement for f32 {}
impl FloatElement for f64 {}

/// Numeric element types that can cross the host boundary as plain values.
pub trait HostScalar: NumericElement + Copy + PartialEq + std::fmt::Debug + Send + Sync {
    fn to_le_bytes_vec(values: &[Self]) -> Vec<u8>;
    fn from_le_bytes_vec(bytes: &[u8]) -> Option<Vec<Self>>;
}

macro_rules! host_scalar {
    ($ty:ty, $width:expr) => {
        impl HostScalar for $ty {
            fn to_le_bytes_vec(values: &[Self]) -> Vec<u8> {
                let mut out = Vec::with_capacity(values.len() * $width);
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                out
            }

            fn from_le_bytes_vec(bytes: &[u8]) -> Option<Vec<Self>> {
                if bytes.len() % $width != 0 {
                    return None;
                }
                Some(
                    bytes
                        .chunks_exact($width)
                        .map(|chunk| {
                            let mut buf = [0u8; $width];
                            buf.copy_from_slice(chunk);
                            <$ty>::from_le_bytes(buf)
                        })
                        .collect(),
                )
            }
        }
    };
}

host_scalar!(f32, 4);
host_scalar!(f64, 8);
host_scalar!(i32, 4);
host_scalar!(i64, 8);
