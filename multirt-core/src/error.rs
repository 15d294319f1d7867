//! Error taxonomy for the instance pool.
//!
//! Recoverable errors (`ModelLoad`, `ModelInvocation`, `UnknownHandle`, ...)
//! are returned to the caller with the instance lock already released.
//! Fatal errors (`Initialization`, `Teardown`) mean the engine replicas can no
//! longer be trusted; hosts are expected to exit with [`FATAL_EXIT_CODE`].

use std::path::PathBuf;
use thiserror::Error;

use crate::pool::ModelHandle;

/// Process exit status used when a fatal error leaves engine state unknown.
pub const FATAL_EXIT_CODE: i32 = 120;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Duplicate registry entry, engine creation or bootstrap failure.
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("failed to load model {path:?} into instance {instance}: {message}")]
    ModelLoad {
        instance: usize,
        path: PathBuf,
        message: String,
    },

    #[error("model {handle} failed in forward: {message}")]
    ModelInvocation { handle: ModelHandle, message: String },

    #[error("unknown model handle {0}")]
    UnknownHandle(ModelHandle),

    /// Finalization failed; the process must not continue.
    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("engine instance {index} does not exist (pool has {count})")]
    InvalidInstance { index: usize, count: usize },

    #[error("instance pool has been torn down")]
    PoolClosed,

    /// A thread panicked while holding the instance lock.
    #[error("engine instance {0} is poisoned")]
    Poisoned(usize),

    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

impl RuntimeError {
    /// Returns `true` for errors after which the process must terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization(_) | Self::Teardown(_))
    }
}
