//! multirt Core - Multi-Instance Scripting Engine Runtime
//!
//! Hosts N isolated replicas of an embedded scripting engine in one process
//! so independent callers can run model inference in parallel instead of
//! serializing on a single global interpreter lock.
//!
//! # Architecture:
//! - [`NativeModuleRegistry`]: native modules every instance may import
//! - [`SharedSingletonBridge`]: routes the one process-global native module
//!   (the tensor library) to a single shared object
//! - [`InstancePool`]: owns the engine replicas, each behind its own lock
//! - [`ModelLoader`] / [`ForwardDispatcher`]: load models into an instance
//!   and invoke them by [`ModelHandle`]
//! - [`Runtime`]: async facade over the blocking pool

pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod metrics;
pub mod module;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod tensor;

pub use config::{LoaderConfig, PoolConfig};
pub use engine::{Engine, EngineError, ManifestEngine};
pub use error::{Result, RuntimeError, FATAL_EXIT_CODE};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use module::{ModuleInitError, NativeModule};
pub use pool::{
    EngineInstance, ForwardDispatcher, InstancePool, InstanceSelector, ModelHandle, ModelLoader,
};
pub use registry::{NativeModuleRegistry, Routing};
pub use resolver::{ModuleResolver, Resolution, ResolverChain, SharedModuleRecord, SharedSingletonBridge};
pub use runtime::{InferenceService, Runtime};
pub use tensor::{Tensor, TensorError, TensorLibrary};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the `info` default. Safe to call more than once;
/// later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
