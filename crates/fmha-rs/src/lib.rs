//! Fused multi-head attention as a pair of compiler operators.
//!
//! The crate does no arithmetic. It validates tensor metadata, infers result descriptors,
//! encodes the external kernel's backend configuration and lowers each operator to a single
//! opaque kernel call that a [`HostExecutor`] schedules.

pub mod attention;
pub mod autodiff;
pub mod backend_config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod inference;
pub mod logging;
pub mod lowering;
pub mod registry;

pub use attention::{default_registry, register_attention_operators, AttentionOperators};
pub use autodiff::{dot_product_attention, AttentionGrads, FusedAttention, ResidualBundle};
pub use backend_config::{BackendConfig, FmhaParams, GemmStage};
pub use descriptor::{DType, Shape, TensorDescriptor};
pub use env::FusedAttentionOptions;
pub use error::{
    ExternalKernelError, FmhaError, FmhaResult, LoweringError, RegistryError, ValidationError,
};
pub use executor::{GraphRecorder, HostExecutor, SymbolicTensor};
pub use inference::{infer_backward, infer_forward, AttentionDims};
pub use lowering::{KernelInvocation, LoweringDispatcher, Platform};
pub use registry::{OperatorRegistry, OperatorRegistryBuilder};
