//! Seam between kernel invocations and whatever engine runs them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::descriptor::TensorDescriptor;
use crate::error::ExternalKernelError;
use crate::lowering::KernelInvocation;

/// Host execution engine that schedules kernel invocations.
///
/// Implementations own device memory and stream ordering. Failures they report are passed
/// through to callers untouched.
pub trait HostExecutor {
    type TensorHandle: Clone;

    /// Returns the static metadata of a handle.
    fn descriptor(&self, tensor: &Self::TensorHandle) -> TensorDescriptor;

    /// Runs one invocation, returning one handle per result in invocation order.
    fn execute(
        &self,
        invocation: &KernelInvocation,
        operands: &[Self::TensorHandle],
    ) -> Result<Vec<Self::TensorHandle>, ExternalKernelError>;
}

/// Handle produced by [`GraphRecorder`]: an id plus static metadata, no storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicTensor {
    pub id: u64,
    pub descriptor: TensorDescriptor,
}

/// One invocation captured by [`GraphRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub invocation: KernelInvocation,
    pub operands: Vec<u64>,
    pub results: Vec<u64>,
}

/// Trace-only executor: records each invocation and hands back symbolic results.
///
/// Useful for building a kernel call graph ahead of time and for inspecting exactly what the
/// lowering emitted.
#[derive(Debug, Default)]
pub struct GraphRecorder {
    next_id: AtomicU64,
    calls: Mutex<Vec<RecordedCall>>,
}

impl GraphRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph input with the given metadata.
    pub fn placeholder(&self, descriptor: TensorDescriptor) -> SymbolicTensor {
        SymbolicTensor {
            id: self.fresh_id(),
            descriptor,
        }
    }

    /// Snapshot of the invocations recorded so far, in execution order.
    pub fn calls(&self) -> Result<Vec<RecordedCall>, ExternalKernelError> {
        Ok(self.lock_calls()?.clone())
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_calls(&self) -> Result<MutexGuard<'_, Vec<RecordedCall>>, ExternalKernelError> {
        self.calls
            .lock()
            .map_err(|_| ExternalKernelError::new("graph recorder call log poisoned"))
    }
}

impl HostExecutor for GraphRecorder {
    type TensorHandle = SymbolicTensor;

    fn descriptor(&self, tensor: &SymbolicTensor) -> TensorDescriptor {
        tensor.descriptor.clone()
    }

    fn execute(
        &self,
        invocation: &KernelInvocation,
        operands: &[SymbolicTensor],
    ) -> Result<Vec<SymbolicTensor>, ExternalKernelError> {
        let results: Vec<SymbolicTensor> = invocation
            .result_descriptors()
            .map(|descriptor| self.placeholder(descriptor.clone()))
            .collect();
        self.lock_calls()?.push(RecordedCall {
            invocation: invocation.clone(),
            operands: operands.iter().map(|tensor| tensor.id).collect(),
            results: results.iter().map(|tensor| tensor.id).collect(),
        });
        tracing::trace!(call = %invocation, "recorded kernel invocation");
        Ok(results)
    }
}
