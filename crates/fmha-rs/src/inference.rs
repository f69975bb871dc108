//! Static shape/dtype inference for the fused attention operators.
//!
//! Everything here is a pure function of descriptors. Checks run in a fixed order (rank, dtype,
//! then cross-tensor extents) so the first reported error is stable for a given input.

use serde::{Deserialize, Serialize};

use crate::attention::{BACKWARD_OPERATOR, FORWARD_OPERATOR};
use crate::descriptor::{activation_axis, qkv_axis, DType, TensorDescriptor, ATTENTION_RANK};
use crate::error::ValidationError;

/// Problem extents shared by the forward and backward kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttentionDims {
    pub batch: usize,
    pub q_seq_len: usize,
    pub kv_seq_len: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
}

impl AttentionDims {
    /// `[batch, q_seq, heads, head_dim]`, the query and output layout.
    pub fn output_descriptor(&self) -> TensorDescriptor {
        TensorDescriptor::new(
            self.dtype,
            [self.batch, self.q_seq_len, self.num_heads, self.head_dim],
        )
    }

    /// `[batch, heads, q_seq, kv_seq]`, the softmax activation layout.
    pub fn activation_descriptor(&self) -> TensorDescriptor {
        TensorDescriptor::new(self.dtype, self.activation_dims())
    }

    pub fn activation_dims(&self) -> [usize; ATTENTION_RANK] {
        let mut dims = [0; ATTENTION_RANK];
        dims[activation_axis::BATCH] = self.batch;
        dims[activation_axis::HEADS] = self.num_heads;
        dims[activation_axis::Q_SEQ] = self.q_seq_len;
        dims[activation_axis::KV_SEQ] = self.kv_seq_len;
        dims
    }
}

/// Infers `(output, activation)` descriptors for the forward operator.
pub fn infer_forward(
    query: &TensorDescriptor,
    key: &TensorDescriptor,
    value: &TensorDescriptor,
) -> Result<(TensorDescriptor, TensorDescriptor), ValidationError> {
    let dims = validate_qkv(FORWARD_OPERATOR, query, key, value)?;
    Ok((dims.output_descriptor(), dims.activation_descriptor()))
}

/// Infers `(grad_query, grad_key, grad_value)` descriptors for the backward operator.
///
/// Each gradient has exactly the descriptor of the forward input it differentiates.
pub fn infer_backward(
    grad_output: &TensorDescriptor,
    query: &TensorDescriptor,
    key: &TensorDescriptor,
    value: &TensorDescriptor,
    activation: &TensorDescriptor,
) -> Result<(TensorDescriptor, TensorDescriptor, TensorDescriptor), ValidationError> {
    let op = BACKWARD_OPERATOR;
    ensure_rank(op, "grad_output", grad_output)?;
    ensure_rank(op, "activation", activation)?;
    let dims = validate_qkv(op, query, key, value)?;

    ensure_dtype_matches_query(op, "grad_output", grad_output, dims.dtype)?;
    ensure_dtype_matches_query(op, "activation", activation, dims.dtype)?;

    let expected_grad = dims.output_descriptor();
    if grad_output.shape != expected_grad.shape {
        return Err(ValidationError::shape_mismatch(
            op,
            format!(
                "grad_output shape {} must equal output shape {}",
                grad_output.shape, expected_grad.shape
            ),
        ));
    }
    if activation.dims() != dims.activation_dims() {
        return Err(ValidationError::shape_mismatch(
            op,
            format!(
                "activation shape {} must be [batch, heads, q_seq, kv_seq] = {:?}",
                activation.shape,
                dims.activation_dims()
            ),
        ));
    }

    Ok((query.clone(), key.clone(), value.clone()))
}

/// Validates query/key/value and extracts the problem extents.
pub fn validate_qkv(
    op: &'static str,
    query: &TensorDescriptor,
    key: &TensorDescriptor,
    value: &TensorDescriptor,
) -> Result<AttentionDims, ValidationError> {
    ensure_rank(op, "query", query)?;
    ensure_rank(op, "key", key)?;
    ensure_rank(op, "value", value)?;

    if !query.dtype.is_supported() {
        return Err(ValidationError::unsupported_dtype(
            op,
            "query",
            query.dtype,
            "only f16 and bf16 are supported",
        ));
    }
    ensure_dtype_matches_query(op, "key", key, query.dtype)?;
    ensure_dtype_matches_query(op, "value", value, query.dtype)?;

    for (name, desc) in [("query", query), ("key", key), ("value", value)] {
        if let Some(axis) = desc.dims().iter().position(|dim| *dim == 0) {
            return Err(ValidationError::shape_mismatch(
                op,
                format!("{name} axis {axis} has zero length"),
            ));
        }
    }

    let q = query.dims();
    let k = key.dims();
    let v = value.dims();
    ensure_axis_agrees(op, "batch", qkv_axis::BATCH, ("query", q), ("key", k))?;
    ensure_axis_agrees(op, "batch", qkv_axis::BATCH, ("query", q), ("value", v))?;
    ensure_axis_agrees(op, "head count", qkv_axis::HEADS, ("query", q), ("key", k))?;
    ensure_axis_agrees(op, "head count", qkv_axis::HEADS, ("query", q), ("value", v))?;
    ensure_axis_agrees(op, "sequence length", qkv_axis::SEQ, ("key", k), ("value", v))?;
    ensure_axis_agrees(op, "head dim", qkv_axis::HEAD_DIM, ("query", q), ("key", k))?;
    // The output inherits the query layout, so value rows must be query-sized too.
    ensure_axis_agrees(op, "head dim", qkv_axis::HEAD_DIM, ("query", q), ("value", v))?;

    Ok(AttentionDims {
        batch: q[qkv_axis::BATCH],
        q_seq_len: q[qkv_axis::SEQ],
        kv_seq_len: k[qkv_axis::SEQ],
        num_heads: q[qkv_axis::HEADS],
        head_dim: q[qkv_axis::HEAD_DIM],
        dtype: query.dtype,
    })
}

fn ensure_rank(
    op: &'static str,
    operand: &'static str,
    desc: &TensorDescriptor,
) -> Result<(), ValidationError> {
    if desc.rank() != ATTENTION_RANK {
        return Err(ValidationError::Rank {
            operator: op,
            operand,
            expected: ATTENTION_RANK,
            found: desc.rank(),
        });
    }
    Ok(())
}

fn ensure_dtype_matches_query(
    op: &'static str,
    operand: &'static str,
    desc: &TensorDescriptor,
    query_dtype: DType,
) -> Result<(), ValidationError> {
    if desc.dtype != query_dtype {
        return Err(ValidationError::unsupported_dtype(
            op,
            operand,
            desc.dtype,
            format!("must match query dtype {query_dtype:?}"),
        ));
    }
    Ok(())
}

fn ensure_axis_agrees(
    op: &'static str,
    what: &str,
    axis: usize,
    (lhs_name, lhs): (&str, &[usize]),
    (rhs_name, rhs): (&str, &[usize]),
) -> Result<(), ValidationError> {
    if lhs[axis] != rhs[axis] {
        return Err(ValidationError::shape_mismatch(
            op,
            format!(
                "{what} disagrees: {lhs_name} axis {axis} is {}, {rhs_name} axis {axis} is {}",
                lhs[axis], rhs[axis]
            ),
        ));
    }
    Ok(())
}
