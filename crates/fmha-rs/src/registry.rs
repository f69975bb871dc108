//! Operator registry binding operator names to their arity and abstract-evaluation rule.
//!
//! Registration happens on an [`OperatorRegistryBuilder`] during setup. Finishing the builder
//! yields an immutable [`OperatorRegistry`] that is `Send + Sync` and can be consulted from any
//! number of graph-construction threads without locking. Execution itself is never registered
//! here: every operator runs by being lowered to an external kernel call (see
//! [`crate::lowering`]).

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::descriptor::TensorDescriptor;
use crate::error::{RegistryError, ValidationError};

/// Computes result descriptors from operand descriptors without touching data.
pub type AbstractEvalFn = fn(&[TensorDescriptor]) -> Result<Vec<TensorDescriptor>, ValidationError>;

/// A named multi-result operator with a fixed operand count.
pub struct Operator {
    name: String,
    arity: usize,
    result_count: usize,
    abstract_eval: AbstractEvalFn,
}

impl Operator {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Runs the abstract-evaluation rule after checking the operand count.
    pub fn abstract_eval(
        &self,
        operands: &[TensorDescriptor],
    ) -> Result<Vec<TensorDescriptor>, ValidationError> {
        if operands.len() != self.arity {
            return Err(ValidationError::Arity {
                operator: self.name.clone(),
                expected: self.arity,
                found: operands.len(),
            });
        }
        let results = (self.abstract_eval)(operands)?;
        debug_assert_eq!(
            results.len(),
            self.result_count,
            "abstract eval of {} returned the wrong number of results",
            self.name
        );
        Ok(results)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("result_count", &self.result_count)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a registered operator.
#[derive(Debug, Clone)]
pub struct OperatorHandle(Arc<Operator>);

impl Deref for OperatorHandle {
    type Target = Operator;

    fn deref(&self) -> &Operator {
        &self.0
    }
}

impl PartialEq for OperatorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for OperatorHandle {}

/// Mutable registration phase of an [`OperatorRegistry`].
#[derive(Debug, Default)]
pub struct OperatorRegistryBuilder {
    operators: HashMap<String, OperatorHandle>,
}

impl OperatorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operator under `name`.
    ///
    /// Fails with [`RegistryError::DuplicateOperator`] when the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        arity: usize,
        result_count: usize,
        abstract_eval: AbstractEvalFn,
    ) -> Result<OperatorHandle, RegistryError> {
        let name = name.into();
        if self.operators.contains_key(&name) {
            return Err(RegistryError::DuplicateOperator(name));
        }
        let handle = OperatorHandle(Arc::new(Operator {
            name: name.clone(),
            arity,
            result_count,
            abstract_eval,
        }));
        tracing::debug!(operator = %name, arity, result_count, "registered operator");
        self.operators.insert(name, handle.clone());
        Ok(handle)
    }

    /// Freezes the registry. No further registration is possible afterwards.
    pub fn build(self) -> OperatorRegistry {
        OperatorRegistry {
            operators: self.operators,
        }
    }
}

/// Read-only table of registered operators.
#[derive(Debug)]
pub struct OperatorRegistry {
    operators: HashMap<String, OperatorHandle>,
}

impl OperatorRegistry {
    pub fn builder() -> OperatorRegistryBuilder {
        OperatorRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Result<OperatorHandle, RegistryError> {
        self.operators
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownOperator(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Registered operator names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}
