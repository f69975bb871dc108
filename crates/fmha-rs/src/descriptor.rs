//! Tensor metadata shared by inference, config encoding and lowering.
//!
//! Descriptors carry only static extents: every operand of the fused attention kernel has a
//! fully known shape by the time a graph is built, so there is no dynamic-dimension variant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Enumerates scalar element types a tensor descriptor may carry.
///
/// Only [`DType::F16`] and [`DType::Bf16`] are accepted by the fused attention operators; the
/// remaining variants exist so callers can describe (and be rejected for) other tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Si32,
    Si64,
    Fp8E4M3,
    Fp8E5M2,
    Bf16,
    F16,
    F32,
    F64,
}

/// Element types the fused attention kernel accepts.
pub const SUPPORTED_DTYPES: [DType; 2] = [DType::F16, DType::Bf16];

impl DType {
    /// Returns `true` for the two low-precision formats the kernel supports.
    pub fn is_supported(self) -> bool {
        SUPPORTED_DTYPES.contains(&self)
    }

    /// Element type tag used inside the backend configuration payload.
    pub fn backend_type_tag(self) -> Option<&'static str> {
        match self {
            DType::Bf16 => Some("BF16"),
            DType::F16 => Some("F16"),
            _ => None,
        }
    }

    /// Lower-case mnemonic used when rendering invocations as text.
    pub fn mnemonic(self) -> &'static str {
        match self {
            DType::I1 => "pred",
            DType::Si8 => "s8",
            DType::Si32 => "s32",
            DType::Si64 => "s64",
            DType::Fp8E4M3 => "f8e4m3",
            DType::Fp8E5M2 => "f8e5m2",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Returns the storage bit-width of one element.
    pub fn bitwidth(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si8 | DType::Fp8E4M3 | DType::Fp8E5M2 => 8,
            DType::Bf16 | DType::F16 => 16,
            DType::Si32 | DType::F32 => 32,
            DType::Si64 | DType::F64 => 64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Logical tensor shape as an ordered list of axis extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Tensor metadata coupling dtype and shape.
///
/// Descriptors are values: inference produces fresh ones and nothing mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorDescriptor {
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Returns total byte length, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        let bits = self.shape.element_count()?.checked_mul(self.dtype.bitwidth())?;
        Some(bits.div_ceil(8))
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// Role each axis plays in the four-axis query/key/value/output layout.
pub mod qkv_axis {
    pub const BATCH: usize = 0;
    pub const SEQ: usize = 1;
    pub const HEADS: usize = 2;
    pub const HEAD_DIM: usize = 3;
}

/// Role each axis plays in the four-axis activation layout.
pub mod activation_axis {
    pub const BATCH: usize = 0;
    pub const HEADS: usize = 1;
    pub const Q_SEQ: usize = 2;
    pub const KV_SEQ: usize = 3;
}

/// Rank shared by every operand and result of the fused attention operators.
pub const ATTENTION_RANK: usize = 4;
