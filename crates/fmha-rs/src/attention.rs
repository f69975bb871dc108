//! Fused dot-product attention operator definitions.
//!
//! Two operators exist: the forward pass `(query, key, value) -> (output, activation)` and the
//! backward pass `(grad_output, query, key, value, activation) -> (grad_query, grad_key,
//! grad_value)`. Both share the `[batch, seq, heads, head_dim]` operand layout.

use std::sync::{Arc, OnceLock};

use crate::descriptor::TensorDescriptor;
use crate::error::{RegistryError, ValidationError};
use crate::inference::{infer_backward, infer_forward};
use crate::registry::{OperatorHandle, OperatorRegistry, OperatorRegistryBuilder};

pub const FORWARD_OPERATOR: &str = "dot_product_attention_fwd";
pub const BACKWARD_OPERATOR: &str = "dot_product_attention_bwd";

pub const FORWARD_ARITY: usize = 3;
pub const FORWARD_RESULTS: usize = 2;
pub const BACKWARD_ARITY: usize = 5;
pub const BACKWARD_RESULTS: usize = 3;

/// Handles returned when the attention operators are registered.
#[derive(Debug, Clone)]
pub struct AttentionOperators {
    pub forward: OperatorHandle,
    pub backward: OperatorHandle,
}

/// Registers the forward and backward operators.
pub fn register_attention_operators(
    builder: &mut OperatorRegistryBuilder,
) -> Result<AttentionOperators, RegistryError> {
    let forward = builder.register(
        FORWARD_OPERATOR,
        FORWARD_ARITY,
        FORWARD_RESULTS,
        forward_abstract_eval,
    )?;
    let backward = builder.register(
        BACKWARD_OPERATOR,
        BACKWARD_ARITY,
        BACKWARD_RESULTS,
        backward_abstract_eval,
    )?;
    Ok(AttentionOperators { forward, backward })
}

static DEFAULT_REGISTRY: OnceLock<Arc<OperatorRegistry>> = OnceLock::new();

/// Process-wide registry holding the attention operators, built on first use.
///
/// Tests and embedders that need isolation build their own registry instead.
pub fn default_registry() -> Arc<OperatorRegistry> {
    DEFAULT_REGISTRY
        .get_or_init(|| {
            let mut builder = OperatorRegistry::builder();
            register_attention_operators(&mut builder)
                .expect("attention operators register into an empty registry");
            Arc::new(builder.build())
        })
        .clone()
}

fn forward_abstract_eval(
    operands: &[TensorDescriptor],
) -> Result<Vec<TensorDescriptor>, ValidationError> {
    let [query, key, value] = operands else {
        return Err(arity_error(FORWARD_OPERATOR, FORWARD_ARITY, operands.len()));
    };
    let (output, activation) = infer_forward(query, key, value)?;
    Ok(vec![output, activation])
}

fn backward_abstract_eval(
    operands: &[TensorDescriptor],
) -> Result<Vec<TensorDescriptor>, ValidationError> {
    let [grad_output, query, key, value, activation] = operands else {
        return Err(arity_error(BACKWARD_OPERATOR, BACKWARD_ARITY, operands.len()));
    };
    let (grad_query, grad_key, grad_value) =
        infer_backward(grad_output, query, key, value, activation)?;
    Ok(vec![grad_query, grad_key, grad_value])
}

fn arity_error(operator: &str, expected: usize, found: usize) -> ValidationError {
    ValidationError::Arity {
        operator: operator.to_string(),
        expected,
        found,
    }
}
