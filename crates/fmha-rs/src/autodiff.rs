//! Forward/backward pairing for fused attention.
//!
//! [`FusedAttention::forward`] runs the forward kernel and returns the attention output together
//! with a [`ResidualBundle`] holding what the backward kernel needs. The bundle is moved into
//! [`FusedAttention::backward`], so each one is consumed at most once. Handing a bundle to a
//! binder other than the one that produced it, or with a different scale, is a programming
//! error and panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::attention::{default_registry, BACKWARD_OPERATOR, FORWARD_OPERATOR};
use crate::backend_config::{BackendConfig, FmhaParams};
use crate::descriptor::TensorDescriptor;
use crate::env::FusedAttentionOptions;
use crate::error::{ExternalKernelError, FmhaError, FmhaResult};
use crate::executor::HostExecutor;
use crate::inference::validate_qkv;
use crate::lowering::{LoweringDispatcher, Platform};
use crate::registry::OperatorRegistry;

static NEXT_BINDER_ID: AtomicU64 = AtomicU64::new(0);

/// Saved forward state required by the backward pass.
#[derive(Debug)]
pub struct ResidualBundle<T> {
    binder: u64,
    scale: f64,
    activation: T,
    query: T,
    key: T,
    value: T,
    output: TensorDescriptor,
}

impl<T> ResidualBundle<T> {
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Softmax activation in `[batch, heads, q_seq, kv_seq]` layout.
    pub fn activation(&self) -> &T {
        &self.activation
    }

    /// Descriptor the incoming output gradient is expected to have.
    pub fn output_descriptor(&self) -> &TensorDescriptor {
        &self.output
    }
}

/// Gradients with respect to query, key and value.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionGrads<T> {
    pub grad_query: T,
    pub grad_key: T,
    pub grad_value: T,
}

/// Binds the forward and backward operators into one differentiable attention call.
pub struct FusedAttention<E: HostExecutor> {
    id: u64,
    registry: Arc<OperatorRegistry>,
    dispatcher: Arc<LoweringDispatcher>,
    executor: Arc<E>,
    platform: Platform,
}

impl<E: HostExecutor> FusedAttention<E> {
    /// Binder over the process-wide registry and the built-in lowering rules.
    pub fn new(executor: Arc<E>) -> FmhaResult<Self> {
        Self::with_options(executor, &FusedAttentionOptions::default())
    }

    pub fn with_options(executor: Arc<E>, options: &FusedAttentionOptions) -> FmhaResult<Self> {
        Ok(Self::from_parts(
            default_registry(),
            Arc::new(LoweringDispatcher::with_default_rules()?),
            executor,
            options.platform,
        ))
    }

    pub fn from_parts(
        registry: Arc<OperatorRegistry>,
        dispatcher: Arc<LoweringDispatcher>,
        executor: Arc<E>,
        platform: Platform,
    ) -> Self {
        Self {
            id: NEXT_BINDER_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            dispatcher,
            executor,
            platform,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Runs the forward kernel, returning the output and the residuals for [`Self::backward`].
    pub fn forward(
        &self,
        query: &E::TensorHandle,
        key: &E::TensorHandle,
        value: &E::TensorHandle,
        scale: f64,
    ) -> FmhaResult<(E::TensorHandle, ResidualBundle<E::TensorHandle>)> {
        let operands = [query.clone(), key.clone(), value.clone()];
        let [output, activation] = self.apply(FORWARD_OPERATOR, &operands, 0, scale)?;

        let residuals = ResidualBundle {
            binder: self.id,
            scale,
            activation,
            query: query.clone(),
            key: key.clone(),
            value: value.clone(),
            output: self.executor.descriptor(&output),
        };
        tracing::debug!(binder = self.id, scale, "forward residuals captured");
        Ok((output, residuals))
    }

    /// Consumes the residuals of a matching [`Self::forward`] call and returns
    /// `(grad_query, grad_key, grad_value)`.
    ///
    /// # Panics
    ///
    /// If the bundle came from a different binder or `scale` differs from the forward scale.
    pub fn backward(
        &self,
        scale: f64,
        residuals: ResidualBundle<E::TensorHandle>,
        grad_output: &E::TensorHandle,
    ) -> FmhaResult<AttentionGrads<E::TensorHandle>> {
        assert_eq!(
            residuals.binder, self.id,
            "residual bundle belongs to a different attention binder"
        );
        assert!(
            residuals.scale.to_bits() == scale.to_bits(),
            "backward scale {scale} does not match forward scale {}",
            residuals.scale
        );

        let ResidualBundle {
            activation,
            query,
            key,
            value,
            ..
        } = residuals;
        let operands = [grad_output.clone(), query, key, value, activation];
        let [grad_query, grad_key, grad_value] =
            self.apply(BACKWARD_OPERATOR, &operands, 1, scale)?;
        tracing::debug!(binder = self.id, "residuals consumed by backward");
        Ok(AttentionGrads {
            grad_query,
            grad_key,
            grad_value,
        })
    }

    /// Attention output only, discarding the residuals.
    pub fn attention(
        &self,
        query: &E::TensorHandle,
        key: &E::TensorHandle,
        value: &E::TensorHandle,
        scale: f64,
    ) -> FmhaResult<E::TensorHandle> {
        self.forward(query, key, value, scale)
            .map(|(output, _residuals)| output)
    }

    /// Validates, lowers and executes one operator application. `qkv` is the operand index of
    /// the query; key and value follow it.
    fn apply<const N: usize>(
        &self,
        operator: &'static str,
        operands: &[E::TensorHandle],
        qkv: usize,
        scale: f64,
    ) -> FmhaResult<[E::TensorHandle; N]> {
        let descriptors: Vec<TensorDescriptor> = operands
            .iter()
            .map(|tensor| self.executor.descriptor(tensor))
            .collect();
        let handle = self.registry.get(operator)?;
        let results = handle.abstract_eval(&descriptors)?;
        let dims = validate_qkv(
            operator,
            &descriptors[qkv],
            &descriptors[qkv + 1],
            &descriptors[qkv + 2],
        )?;
        let config = BackendConfig::encode(&dims, &FmhaParams::new(scale))?;
        let invocation =
            self.dispatcher
                .lower(self.platform, operator, &descriptors, &results, &config)?;
        let outputs = self
            .executor
            .execute(&invocation, &invocation.select_operands(operands))?;
        let found = outputs.len();
        outputs.try_into().map_err(|_| {
            FmhaError::from(ExternalKernelError::new(format!(
                "{operator}: executor returned {found} results, expected {N}"
            )))
        })
    }
}

/// One-shot attention over a fresh binder with default options.
pub fn dot_product_attention<E: HostExecutor>(
    executor: Arc<E>,
    query: &E::TensorHandle,
    key: &E::TensorHandle,
    value: &E::TensorHandle,
    scale: f64,
) -> FmhaResult<E::TensorHandle> {
    FusedAttention::new(executor)?.attention(query, key, value, scale)
}
