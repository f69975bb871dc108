use std::sync::Arc;

use crate::attention::{
    BACKWARD_ARITY, BACKWARD_OPERATOR, BACKWARD_RESULTS, FORWARD_ARITY, FORWARD_OPERATOR,
    FORWARD_RESULTS,
};
use crate::error::LoweringError;

use super::{
    ensure_count, KernelInvocation, LaidOutTensor, LoweringDispatcher, LoweringRequest,
    LoweringRule, Platform,
};

/// cuDNN fused softmax-attention forward kernel.
pub const CUDNN_FMHA_SOFTMAX_TARGET: &str = "__cudnn$fhmaSoftmax";
/// cuDNN fused softmax-attention backward kernel.
pub const CUDNN_FMHA_SOFTMAX_BACKWARD_TARGET: &str = "__cudnn$fhmaSoftmaxBackward";

/// Lowers an operator to a single opaque custom call with dense layouts.
///
/// The first `skipped_inputs` operator inputs are consumed by the operator but not passed to
/// the kernel.
#[derive(Debug, Clone)]
pub struct CustomCallRule {
    target: &'static str,
    operand_count: usize,
    result_count: usize,
    skipped_inputs: usize,
}

impl CustomCallRule {
    pub const fn new(target: &'static str, operand_count: usize, result_count: usize) -> Self {
        Self {
            target,
            operand_count,
            result_count,
            skipped_inputs: 0,
        }
    }

    pub fn skipping_inputs(mut self, count: usize) -> Self {
        self.skipped_inputs = count;
        self
    }
}

impl LoweringRule for CustomCallRule {
    fn call_target(&self) -> &str {
        self.target
    }

    fn lower(&self, request: &LoweringRequest<'_>) -> Result<KernelInvocation, LoweringError> {
        ensure_count(
            request.operator,
            "operands",
            self.operand_count,
            request.operands.len(),
        )?;
        ensure_count(
            request.operator,
            "results",
            self.result_count,
            request.results.len(),
        )?;
        let backend_config = request.config.to_json_string()?;
        let operand_sources: Vec<usize> = (self.skipped_inputs..self.operand_count).collect();
        Ok(KernelInvocation {
            operator: request.operator.to_string(),
            platform: request.platform,
            call_target: self.target.to_string(),
            operands: operand_sources
                .iter()
                .map(|source| LaidOutTensor::dense(request.operands[*source].clone()))
                .collect(),
            operand_sources,
            results: request
                .results
                .iter()
                .cloned()
                .map(LaidOutTensor::dense)
                .collect(),
            backend_config,
        })
    }
}

/// Installs the forward and backward cuDNN rules.
///
/// Kernel operands are `(query, key, value)` forward and `(query, key, value, activation)`
/// backward. The backward operator's leading `grad_output` input is not a kernel operand.
pub fn register_cuda_rules(dispatcher: &mut LoweringDispatcher) -> Result<(), LoweringError> {
    dispatcher.register(
        FORWARD_OPERATOR,
        Platform::Cuda,
        Arc::new(CustomCallRule::new(
            CUDNN_FMHA_SOFTMAX_TARGET,
            FORWARD_ARITY,
            FORWARD_RESULTS,
        )),
    )?;
    dispatcher.register(
        BACKWARD_OPERATOR,
        Platform::Cuda,
        Arc::new(CustomCallRule::new(
            CUDNN_FMHA_SOFTMAX_BACKWARD_TARGET,
            BACKWARD_ARITY,
            BACKWARD_RESULTS,
        )
        .skipping_inputs(1)),
    )?;
    Ok(())
}
