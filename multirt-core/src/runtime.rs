//! Async Runtime Facade
//!
//! The pool API blocks: a forward waits on an OS-level instance lock and then
//! runs the engine on the calling thread. `Runtime` moves those calls onto
//! tokio's blocking thread pool so async hosts can drive many instances at
//! once without stalling their reactor.
//!
//! # Example
//! ```rust,no_run
//! # #[tokio::main] async fn main() -> anyhow::Result<()> {
//! use multirt_core::{InstanceSelector, PoolConfig, Runtime, Tensor};
//! let runtime = Runtime::manifest(&PoolConfig::with_instances(2))?;
//! let handle = runtime.load_model(InstanceSelector::RoundRobin, "identity_model").await?;
//! let output = runtime.forward(handle, Tensor::from_vec(vec![1.0, 2.0])).await?;
//! assert_eq!(output.data(), &[1.0, 2.0]);
//! runtime.teardown().await?;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::PoolConfig;
use crate::engine::manifest::register_builtin_modules;
use crate::engine::{Engine, ManifestEngine};
use crate::error::{Result, RuntimeError};
use crate::metrics::MetricsSnapshot;
use crate::pool::{InstancePool, InstanceSelector, ModelHandle};
use crate::registry::NativeModuleRegistry;
use crate::tensor::Tensor;

/// What embedding hosts program against.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn load_model(&self, selector: InstanceSelector, path: PathBuf) -> Result<ModelHandle>;

    async fn forward(&self, handle: ModelHandle, input: Tensor) -> Result<Tensor>;

    /// Run several forwards concurrently; results keep the input order.
    async fn forward_batch(&self, requests: Vec<(ModelHandle, Tensor)>) -> Vec<Result<Tensor>>;

    async fn teardown(&self) -> Result<()>;

    fn service_name(&self) -> &str;
}

/// Cloneable async handle over an [`InstancePool`].
pub struct Runtime<E: Engine> {
    pool: Arc<InstancePool<E>>,
}

impl<E: Engine> Clone for Runtime<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl Runtime<ManifestEngine> {
    /// Pool of [`ManifestEngine`]s with the builtin native modules.
    pub fn manifest(config: &PoolConfig) -> Result<Self> {
        let mut registry = NativeModuleRegistry::new();
        register_builtin_modules(&mut registry)?;
        let pool = InstancePool::initialize(config, registry, |index| Ok(ManifestEngine::new(index)))?;
        Ok(Self::new(pool))
    }
}

impl<E: Engine> Runtime<E> {
    pub fn new(pool: InstancePool<E>) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &Arc<InstancePool<E>> {
        &self.pool
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pool.metrics().snapshot()
    }

    fn spawn<T, F>(&self, call: F) -> JoinHandle<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&InstancePool<E>) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || call(&*pool))
    }

    async fn join<T>(task: JoinHandle<Result<T>>) -> Result<T> {
        task.await
            .map_err(|e| RuntimeError::TaskFailed(e.to_string()))?
    }

    pub async fn load_model(&self, selector: InstanceSelector, path: impl Into<PathBuf>) -> Result<ModelHandle> {
        let path = path.into();
        Self::join(self.spawn(move |pool| pool.load_model(selector, &path))).await
    }

    pub async fn forward(&self, handle: ModelHandle, input: Tensor) -> Result<Tensor> {
        Self::join(self.spawn(move |pool| pool.forward(handle, &input))).await
    }

    pub async fn forward_batch(&self, requests: Vec<(ModelHandle, Tensor)>) -> Vec<Result<Tensor>> {
        debug!(requests = requests.len(), "Dispatching forward batch");
        let tasks: Vec<_> = requests
            .into_iter()
            .map(|(handle, input)| self.spawn(move |pool| pool.forward(handle, &input)))
            .collect();

        let mut outputs = Vec::with_capacity(tasks.len());
        for task in tasks {
            outputs.push(Self::join(task).await);
        }
        outputs
    }

    /// Waits for in-flight calls on the blocking pool, then finalizes.
    pub async fn teardown(&self) -> Result<()> {
        Self::join(self.spawn(|pool| pool.teardown())).await
    }
}

#[async_trait]
impl<E: Engine> InferenceService for Runtime<E> {
    async fn load_model(&self, selector: InstanceSelector, path: PathBuf) -> Result<ModelHandle> {
        Runtime::load_model(self, selector, path).await
    }

    async fn forward(&self, handle: ModelHandle, input: Tensor) -> Result<Tensor> {
        Runtime::forward(self, handle, input).await
    }

    async fn forward_batch(&self, requests: Vec<(ModelHandle, Tensor)>) -> Vec<Result<Tensor>> {
        Runtime::forward_batch(self, requests).await
    }

    async fn teardown(&self) -> Result<()> {
        Runtime::teardown(self).await
    }

    fn service_name(&self) -> &str {
        "multirt"
    }
}
