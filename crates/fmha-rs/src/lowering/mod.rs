//! Lowering of fused attention operators to external kernel calls.
//!
//! A [`LoweringDispatcher`] maps `(operator, platform)` to a [`LoweringRule`]. Lowering only
//! builds a [`KernelInvocation`] value; scheduling it on a device is the host engine's job.

mod cuda;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend_config::BackendConfig;
use crate::descriptor::TensorDescriptor;
use crate::error::{LoweringError, ValidationError};
use crate::hashing::fnv1a;

pub use cuda::{
    register_cuda_rules, CustomCallRule, CUDNN_FMHA_SOFTMAX_BACKWARD_TARGET,
    CUDNN_FMHA_SOFTMAX_TARGET,
};

/// Execution platforms an operator may be lowered for.
///
/// Only [`Platform::Cuda`] has lowering rules today; the others resolve to
/// [`LoweringError::UnsupportedPlatform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Cuda,
    Rocm,
    Cpu,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Cuda => "cuda",
            Platform::Rocm => "rocm",
            Platform::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Platform::Cuda),
            "rocm" => Ok(Platform::Rocm),
            "cpu" => Ok(Platform::Cpu),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Minor-to-major order for a dense tensor of `rank` axes: `(rank-1, ..., 0)`.
///
/// Layouts depend on rank only, never on tensor contents.
pub fn default_layout(rank: usize) -> Vec<usize> {
    (0..rank).rev().collect()
}

/// Operand or result of a kernel call together with its physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaidOutTensor {
    pub descriptor: TensorDescriptor,
    pub minor_to_major: Vec<usize>,
}

impl LaidOutTensor {
    pub fn dense(descriptor: TensorDescriptor) -> Self {
        let minor_to_major = default_layout(descriptor.rank());
        Self {
            descriptor,
            minor_to_major,
        }
    }
}

impl fmt::Display for LaidOutTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.descriptor)?;
        for (index, axis) in self.minor_to_major.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{axis}")?;
        }
        f.write_str("}")
    }
}

/// Fully described call into the external kernel.
///
/// Constructing one has no side effects; the host may discard it freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInvocation {
    pub operator: String,
    pub platform: Platform,
    pub call_target: String,
    /// Position in the operator's input list of each kernel operand.
    pub operand_sources: Vec<usize>,
    pub operands: Vec<LaidOutTensor>,
    pub results: Vec<LaidOutTensor>,
    /// Serialized [`BackendConfig`], opaque to everything but the kernel.
    pub backend_config: String,
}

impl KernelInvocation {
    /// Stable digest of the whole invocation, suitable as a cache key.
    pub fn fingerprint(&self) -> u64 {
        let bytes = bincode::serialize(self).unwrap_or_default();
        fnv1a(&bytes)
    }

    /// Parses the attached backend configuration payload.
    pub fn decode_backend_config(&self) -> Result<BackendConfig, serde_json::Error> {
        BackendConfig::from_json_str(&self.backend_config)
    }

    /// Picks the kernel operands out of the operator inputs, in kernel order.
    pub fn select_operands<T: Clone>(&self, inputs: &[T]) -> Vec<T> {
        self.operand_sources
            .iter()
            .map(|source| inputs[*source].clone())
            .collect()
    }

    pub fn result_descriptors(&self) -> impl Iterator<Item = &TensorDescriptor> + '_ {
        self.results.iter().map(|result| &result.descriptor)
    }
}

impl fmt::Display for KernelInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |tensors: &[LaidOutTensor]| {
            tensors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "custom_call @{}({}) -> ({}) {{operator = {}, platform = {}, backend_config_bytes = {}}}",
            self.call_target,
            join(&self.operands),
            join(&self.results),
            self.operator,
            self.platform,
            self.backend_config.len()
        )
    }
}

/// Everything a rule needs to emit one kernel call.
#[derive(Debug, Clone, Copy)]
pub struct LoweringRequest<'a> {
    pub operator: &'a str,
    pub platform: Platform,
    pub operands: &'a [TensorDescriptor],
    pub results: &'a [TensorDescriptor],
    pub config: &'a BackendConfig,
}

/// Platform-specific procedure that turns an operator application into a kernel call.
pub trait LoweringRule: Send + Sync {
    /// External call identifier this rule emits.
    fn call_target(&self) -> &str;

    fn lower(&self, request: &LoweringRequest<'_>) -> Result<KernelInvocation, LoweringError>;
}

/// Dispatch table keyed by `(operator, platform)`.
#[derive(Default)]
pub struct LoweringDispatcher {
    rules: BTreeMap<(String, Platform), Arc<dyn LoweringRule>>,
}

impl LoweringDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher preloaded with every built-in rule.
    pub fn with_default_rules() -> Result<Self, LoweringError> {
        let mut dispatcher = Self::new();
        register_cuda_rules(&mut dispatcher)?;
        Ok(dispatcher)
    }

    pub fn register(
        &mut self,
        operator: impl Into<String>,
        platform: Platform,
        rule: Arc<dyn LoweringRule>,
    ) -> Result<(), LoweringError> {
        let operator = operator.into();
        let key = (operator.clone(), platform);
        if self.rules.contains_key(&key) {
            return Err(LoweringError::DuplicateRule { operator, platform });
        }
        tracing::debug!(
            operator = %operator,
            %platform,
            call_target = rule.call_target(),
            "registered lowering rule"
        );
        self.rules.insert(key, rule);
        Ok(())
    }

    pub fn supports(&self, operator: &str, platform: Platform) -> bool {
        self.rules.contains_key(&(operator.to_string(), platform))
    }

    /// Registered `(operator, platform)` pairs in sorted order.
    pub fn rules(&self) -> Vec<(String, Platform)> {
        self.rules.keys().cloned().collect()
    }

    /// Emits the kernel call for `operator` on `platform`.
    ///
    /// Fails with [`LoweringError::UnsupportedPlatform`] before building anything when no rule
    /// is registered; there is no fallback platform.
    pub fn lower(
        &self,
        platform: Platform,
        operator: &str,
        operands: &[TensorDescriptor],
        results: &[TensorDescriptor],
        config: &BackendConfig,
    ) -> Result<KernelInvocation, LoweringError> {
        let rule = self
            .rules
            .get(&(operator.to_string(), platform))
            .ok_or_else(|| LoweringError::UnsupportedPlatform {
                operator: operator.to_string(),
                platform,
            })?;
        let invocation = rule.lower(&LoweringRequest {
            operator,
            platform,
            operands,
            results,
            config,
        })?;
        tracing::debug!(
            operator,
            %platform,
            call_target = %invocation.call_target,
            fingerprint = format_args!("{:016x}", invocation.fingerprint()),
            "lowered operator"
        );
        Ok(invocation)
    }
}

impl fmt::Debug for LoweringDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoweringDispatcher")
            .field("rules", &self.rules())
            .finish()
    }
}

pub(crate) fn ensure_count(
    operator: &str,
    what: &'static str,
    expected: usize,
    found: usize,
) -> Result<(), ValidationError> {
    if expected != found {
        return Err(ValidationError::Arity {
            operator: format!("{operator} ({what})"),
            expected,
            found,
        });
    }
    Ok(())
}
