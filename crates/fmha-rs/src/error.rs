use thiserror::Error;

use crate::descriptor::DType;
use crate::lowering::Platform;

/// Static validation failure raised before any kernel invocation is constructed.
///
/// Validation never partially applies: callers fix their inputs and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{operator}: shape mismatch: {detail}")]
    ShapeMismatch {
        operator: &'static str,
        detail: String,
    },
    #[error("{operator}: unsupported dtype {dtype:?} for {operand}: {detail}")]
    UnsupportedDtype {
        operator: &'static str,
        operand: &'static str,
        dtype: DType,
        detail: String,
    },
    #[error("{operator}: {operand} must have rank {expected}, got rank {found}")]
    Rank {
        operator: &'static str,
        operand: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{operator}: {parameter} must be finite, got {value}")]
    NonFinite {
        operator: &'static str,
        parameter: &'static str,
        value: String,
    },
    #[error("{operator}: expected {expected} operands, got {found}")]
    Arity {
        operator: String,
        expected: usize,
        found: usize,
    },
}

impl ValidationError {
    pub fn shape_mismatch(operator: &'static str, detail: impl Into<String>) -> Self {
        ValidationError::ShapeMismatch {
            operator,
            detail: detail.into(),
        }
    }

    pub fn unsupported_dtype(
        operator: &'static str,
        operand: &'static str,
        dtype: DType,
        detail: impl Into<String>,
    ) -> Self {
        ValidationError::UnsupportedDtype {
            operator,
            operand,
            dtype,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("operator '{0}' is already registered")]
    DuplicateOperator(String),
    #[error("operator '{0}' is not registered")]
    UnknownOperator(String),
}

#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("no lowering registered for operator '{operator}' on platform {platform}")]
    UnsupportedPlatform {
        operator: String,
        platform: Platform,
    },
    #[error("a lowering for operator '{operator}' on platform {platform} is already registered")]
    DuplicateRule {
        operator: String,
        platform: Platform,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("backend config serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by the host engine while running the external kernel.
///
/// The message is surfaced verbatim; this crate never interprets or retries it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("external kernel failure: {message}")]
pub struct ExternalKernelError {
    message: String,
}

impl ExternalKernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error surfaced by the fused attention entry points.
#[derive(Debug, Error)]
pub enum FmhaError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    External(#[from] ExternalKernelError),
}

impl FmhaError {
    /// Returns the validation failure when the error was raised by static checks, including
    /// those surfaced through lowering.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            FmhaError::Validation(err) => Some(err),
            FmhaError::Lowering(LoweringError::Validation(err)) => Some(err),
            _ => None,
        }
    }
}

/// Convenience alias for results returned by the fused attention layer.
pub type FmhaResult<T> = Result<T, FmhaError>;
