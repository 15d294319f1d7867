//! Running a forward call inside a locked instance.

use tracing::trace;

use super::instance::InstanceState;
use super::ModelHandle;
use crate::engine::{Arg, Engine, EngineError};
use crate::error::{Result, RuntimeError};
use crate::tensor::Tensor;

/// Invokes stored forward callables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardDispatcher;

impl ForwardDispatcher {
    /// Call the model behind `handle` with a borrowed input.
    ///
    /// The output is copied out as an owned [`Tensor`] before the engine's
    /// result object is dropped, all while the caller holds the lock.
    pub fn dispatch<E: Engine>(
        &self,
        state: &mut InstanceState<E>,
        handle: ModelHandle,
        input: &Tensor,
    ) -> Result<Tensor> {
        let instance = state.index;
        let invocation_failed = |e: EngineError| RuntimeError::ModelInvocation {
            handle,
            message: e.to_string(),
        };

        let (engine, mut importer, models) = state.split_with_models();
        let callable = models.get(&handle).ok_or(RuntimeError::UnknownHandle(handle))?;

        let result = engine
            .call(&mut importer, callable, Arg::Tensor(input))
            .map_err(invocation_failed)?;
        let output = engine.to_tensor(&result).map_err(invocation_failed);
        drop(result);

        trace!(instance, %handle, "Forward complete");
        output
    }
}
