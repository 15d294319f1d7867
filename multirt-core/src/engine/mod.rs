//! Engine Trait - The Replicated Scripting Runtime
//!
//! An [`Engine`] is one copy of the scripting runtime's global state: its
//! namespace, its object graph, its loaded programs. The runtime treats it as
//! a black box that can bootstrap, import modules, read attributes, call
//! objects and hand back tensors.
//!
//! # Threading Contract:
//! - Engines are `Send` but never shared: each one lives inside exactly one
//!   [`EngineInstance`](crate::pool::EngineInstance) and is only touched while
//!   that instance's lock is held.
//! - Engines never need their own execution lock; the instance lock replaces
//!   it, which is what lets N engines run in parallel.
//! - Native imports must go through the supplied [`Importer`] so that the
//!   instance's resolver chain (and the shared singleton bridge at its front)
//!   sees them.

pub mod manifest;

use std::path::Path;
use thiserror::Error;

use crate::module::ModuleInitError;
use crate::resolver::Importer;
use crate::tensor::Tensor;

pub use manifest::{ManifestEngine, ModelKind, ModelManifest};

/// Errors raised from inside an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bootstrap failed at line {line}: {message}")]
    Bootstrap { line: usize, message: String },

    #[error("cannot import '{module}': {message}")]
    Import { module: String, message: String },

    #[error(transparent)]
    NativeInit(#[from] ModuleInitError),

    #[error("object has no attribute '{0}'")]
    Attribute(String),

    /// The called object raised.
    #[error("{0}")]
    Raised(String),

    #[error("expected a tensor, got {0}")]
    NotATensor(String),

    #[error("finalization failed: {0}")]
    Finalize(String),
}

/// Argument passed across the boundary into an engine call.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Path(&'a Path),
    Tensor(&'a Tensor),
}

/// One isolated replica of the scripting runtime.
pub trait Engine: Send + 'static {
    /// Reference to an object living in this engine's object graph.
    type Object: Send;

    /// Run the bootstrap script (search paths, early imports).
    fn bootstrap(&mut self, importer: &mut Importer<'_>, script: &str) -> Result<(), EngineError>;

    /// Import `module` into this engine's namespace.
    fn import(&mut self, importer: &mut Importer<'_>, module: &str) -> Result<Self::Object, EngineError>;

    fn get_attr(&mut self, object: &Self::Object, attr: &str) -> Result<Self::Object, EngineError>;

    fn call(
        &mut self,
        importer: &mut Importer<'_>,
        callable: &Self::Object,
        arg: Arg<'_>,
    ) -> Result<Self::Object, EngineError>;

    /// Produce an owned tensor from an engine object.
    ///
    /// The returned tensor must stay valid after `object` is dropped.
    fn to_tensor(&mut self, object: &Self::Object) -> Result<Tensor, EngineError>;

    /// Tear down the engine's global state. Called once, at pool teardown.
    fn finalize(&mut self) -> Result<(), EngineError>;
}
