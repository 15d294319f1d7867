//! Instance Pool - N Isolated Engines Behind Per-Instance Locks
//!
//! The pool owns every engine replica, the handle table and the shared
//! singleton module record. It is the only way to reach an engine.
//!
//! # Locking:
//! - Each [`EngineInstance`] has one exclusive lock held for the whole of a
//!   load or forward. Calls on different instances never contend.
//! - The handle table has its own short-lived lock, never held across an
//!   engine call.
//! - A pool-wide gate is read-locked by every load and forward and
//!   write-locked by [`InstancePool::teardown`], so teardown waits for all
//!   in-flight calls and no call can start once it begins.
//! - The singleton's first initialization is guarded by
//!   [`SharedModuleRecord`]'s one-shot cell.

mod dispatch;
mod handles;
mod instance;
mod loader;
mod selector;

pub use dispatch::ForwardDispatcher;
pub use handles::{HandleEntry, HandleTable, ModelHandle};
pub use instance::{EngineInstance, InstanceState};
pub use loader::ModelLoader;
pub use selector::{InstanceSelector, RoundRobin};

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::engine::{Engine, EngineError};
use crate::error::{Result, RuntimeError, FATAL_EXIT_CODE};
use crate::metrics::{PoolMetrics, ScopedTimer, TimerType};
use crate::registry::NativeModuleRegistry;
use crate::resolver::{RegistryResolver, ResolverChain, SharedModuleRecord, SharedSingletonBridge};
use crate::tensor::Tensor;

pub struct InstancePool<E: Engine> {
    instances: Vec<EngineInstance<E>>,
    registry: Arc<NativeModuleRegistry>,
    /// Taken and released at teardown.
    shared: RwLock<Option<Arc<SharedModuleRecord>>>,
    handles: HandleTable,
    loader: ModelLoader,
    dispatcher: ForwardDispatcher,
    selector: RoundRobin,
    metrics: Arc<PoolMetrics>,
    gate: RwLock<PoolState>,
}

/// Lifecycle of the pool gate.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolState {
    Open,
    Closed,
    /// Teardown ran and failed; the reason is reported on every later call.
    Failed(String),
}

impl<E: Engine> InstancePool<E> {
    /// Create `config.instance_count` engines with `factory` and bootstrap
    /// each one.
    ///
    /// The registry is frozen from here on: it moves into the pool, so
    /// nothing can be registered once instances exist.
    pub fn initialize<F>(config: &PoolConfig, mut registry: NativeModuleRegistry, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> std::result::Result<E, EngineError> + Sync,
    {
        let count = config.instance_count;
        if count == 0 {
            return Err(RuntimeError::Initialization(
                "instance_count must be at least 1".to_string(),
            ));
        }

        for library in &config.preload_libraries {
            registry
                .preload_global(library)
                .map_err(|e| RuntimeError::Initialization(format!("{:#}", e)))?;
        }

        let registry = Arc::new(registry);
        let shared = registry
            .singleton()
            .map(|entry| Arc::new(SharedModuleRecord::new(entry.name(), entry.init_fn())));

        let mut startup_modules = config.preload_modules.clone();
        if config.attach_singleton {
            if let Some(record) = &shared {
                if !startup_modules.iter().any(|m| m == record.name()) {
                    startup_modules.push(record.name().to_owned());
                }
            }
        }

        let bootstrap = config.bootstrap_script();
        let metrics = PoolMetrics::new();
        let started = Instant::now();

        let start_instance = |index: usize| -> Result<EngineInstance<E>> {
            let _timer = ScopedTimer::new(&metrics, TimerType::InstanceStart);
            let engine = factory(index).map_err(|e| {
                RuntimeError::Initialization(format!("creating engine {}: {}", index, e))
            })?;

            let mut chain = ResolverChain::new();
            chain.push(Box::new(RegistryResolver::new(registry.clone())));
            if let Some(record) = &shared {
                chain.install_front(Box::new(SharedSingletonBridge::new(record.clone())));
            }
            EngineInstance::create(index, engine, chain, &bootstrap, &startup_modules)
        };

        let instances: Vec<EngineInstance<E>> = if config.parallel_startup && count > 1 {
            std::thread::scope(|scope| {
                let start_instance = &start_instance;
                let workers: Vec<_> = (0..count)
                    .map(|index| scope.spawn(move || start_instance(index)))
                    .collect();
                workers
                    .into_iter()
                    .map(|worker| {
                        worker.join().map_err(|_| {
                            RuntimeError::Initialization("instance startup thread panicked".to_string())
                        })?
                    })
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            (0..count).map(start_instance).collect::<Result<Vec<_>>>()?
        };

        info!(
            instances = count,
            parallel = config.parallel_startup,
            singleton = shared.as_ref().map(|r| r.name()),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Instance pool initialized"
        );

        Ok(Self {
            instances,
            registry,
            shared: RwLock::new(shared),
            handles: HandleTable::new(),
            loader: ModelLoader::new(config.loader.clone()),
            dispatcher: ForwardDispatcher,
            selector: RoundRobin::new(),
            metrics,
            gate: RwLock::new(PoolState::Open),
        })
    }

    /// Hold the gate open for the duration of one call.
    fn enter(&self) -> Result<RwLockReadGuard<'_, PoolState>> {
        let gate = self.gate.read().expect("pool gate lock poisoned");
        if *gate != PoolState::Open {
            return Err(RuntimeError::PoolClosed);
        }
        Ok(gate)
    }

    fn lock_instance(&self, index: usize) -> Result<std::sync::MutexGuard<'_, InstanceState<E>>> {
        let instance = self.instances.get(index).ok_or(RuntimeError::InvalidInstance {
            index,
            count: self.instances.len(),
        })?;
        let _wait = ScopedTimer::new(&self.metrics, TimerType::LockWait);
        instance.lock()
    }

    /// Load the model at `path` into the selected instance.
    pub fn load_model(&self, selector: InstanceSelector, path: impl AsRef<Path>) -> Result<ModelHandle> {
        let path = path.as_ref();
        let _gate = self.enter()?;
        let index = self.selector.pick(selector, self.instances.len())?;

        let started = Instant::now();
        let outcome = {
            let mut state = self.lock_instance(index)?;
            self.loader.load(&mut state, path)
        };

        match outcome {
            Ok(handle) => {
                self.handles.insert(handle, index, path);
                self.metrics.record_load(started.elapsed());
                info!(instance = index, %handle, ?path, "Model loaded");
                Ok(handle)
            }
            Err(e) => {
                self.metrics.record_load_failure();
                warn!(instance = index, ?path, error = %e, "Model load failed");
                Err(e)
            }
        }
    }

    /// Run the model behind `handle` on `input`.
    pub fn forward(&self, handle: ModelHandle, input: &Tensor) -> Result<Tensor> {
        let _gate = self.enter()?;
        let index = self
            .handles
            .instance_of(handle)
            .ok_or(RuntimeError::UnknownHandle(handle))?;

        let started = Instant::now();
        let outcome = {
            let mut state = self.lock_instance(index)?;
            self.dispatcher.dispatch(&mut state, handle, input)
        };

        match &outcome {
            Ok(_) => self.metrics.record_forward(started.elapsed()),
            Err(e) => {
                self.metrics.record_forward_failure();
                debug!(instance = index, %handle, error = %e, "Forward failed");
            }
        }
        outcome
    }

    /// Release every model callable in every instance, then finalize every
    /// instance, then release the shared module.
    ///
    /// Blocks until in-flight calls finish. Calling it again after a clean
    /// teardown is a no-op; after a failed one it reports the same failure.
    pub fn teardown(&self) -> Result<()> {
        let mut gate = self.gate.write().expect("pool gate lock poisoned");
        match &*gate {
            PoolState::Open => {}
            PoolState::Closed => {
                warn!("Instance pool already torn down");
                return Ok(());
            }
            PoolState::Failed(reason) => return Err(RuntimeError::Teardown(reason.clone())),
        }

        let dropped = self.handles.clear();
        for instance in &self.instances {
            let released = instance.release_models();
            debug!(instance = instance.index(), released, "Model callables released");
        }

        let mut failures = Vec::new();
        for instance in &self.instances {
            if let Err(e) = instance.finalize_engine() {
                error!(instance = instance.index(), error = %e, "Engine finalization failed");
                failures.push(format!("instance {}: {}", instance.index(), e));
            }
        }

        // Every bridge went away with its chain, so the pool holds the last
        // reference to the record.
        let record = self.shared.write().expect("shared module lock poisoned").take();
        if let Some(record) = record {
            let name = record.name().to_owned();
            let attachments = record.attachments();
            match Arc::try_unwrap(record) {
                Ok(record) => {
                    let module = record.into_inner();
                    info!(module = %name, attachments, created = module.is_some(), "Shared module released");
                }
                Err(_) => warn!(module = %name, "Shared module still referenced after teardown"),
            }
        }

        if !failures.is_empty() {
            let reason = failures.join("; ");
            *gate = PoolState::Failed(reason.clone());
            return Err(RuntimeError::Teardown(reason));
        }
        *gate = PoolState::Closed;
        info!(instances = self.instances.len(), handles = dropped, "Instance pool torn down");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        *self.gate.read().expect("pool gate lock poisoned") == PoolState::Open
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, index: usize) -> Option<&EngineInstance<E>> {
        self.instances.get(index)
    }

    /// Live handles in load order.
    pub fn loaded_models(&self) -> Vec<ModelHandle> {
        self.handles.handles()
    }

    /// Index of the instance that owns `handle`.
    pub fn instance_of(&self, handle: ModelHandle) -> Option<usize> {
        self.handles.instance_of(handle)
    }

    pub fn registry(&self) -> &NativeModuleRegistry {
        &self.registry
    }

    /// The shared singleton record; `None` without a singleton entry or
    /// after teardown.
    pub fn shared_module(&self) -> Option<Arc<SharedModuleRecord>> {
        self.shared.read().expect("shared module lock poisoned").clone()
    }

    pub fn shared_module_initialized(&self) -> bool {
        self.shared_module().map_or(false, |r| r.is_initialized())
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }
}

impl<E: Engine> Drop for InstancePool<E> {
    /// Tears down a pool that is still open. A failure here leaves engine
    /// state unknown, so the process exits with [`FATAL_EXIT_CODE`].
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.teardown() {
            error!(error = %e, "Teardown on drop failed");
            if e.is_fatal() {
                std::process::exit(FATAL_EXIT_CODE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::manifest::register_builtin_modules;
    use crate::engine::ManifestEngine;
    use std::fs;
    use tempfile::TempDir;

    fn manifest_pool(instances: usize, dir: &TempDir) -> InstancePool<ManifestEngine> {
        let mut registry = NativeModuleRegistry::new();
        register_builtin_modules(&mut registry).unwrap();
        let config = PoolConfig {
            instance_count: instances,
            search_paths: vec![dir.path().to_path_buf()],
            ..PoolConfig::default()
        };
        InstancePool::initialize(&config, registry, |i| Ok(ManifestEngine::new(i))).unwrap()
    }

    #[test]
    fn test_zero_instances_rejected() {
        let err = InstancePool::initialize(&PoolConfig::with_instances(0), NativeModuleRegistry::new(), |i| {
            Ok(ManifestEngine::new(i))
        })
        .err()
        .unwrap();
        assert!(matches!(err, RuntimeError::Initialization(_)));
    }

    #[test]
    fn test_factory_failure_is_fatal() {
        let err = InstancePool::<ManifestEngine>::initialize(
            &PoolConfig::with_instances(3),
            NativeModuleRegistry::new(),
            |i| {
                if i == 2 {
                    Err(EngineError::Raised("out of memory".to_string()))
                } else {
                    Ok(ManifestEngine::new(i))
                }
            },
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("creating engine 2"));
    }

    #[test]
    fn test_round_robin_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("id.json"), r#"{"kind": "identity"}"#).unwrap();
        let pool = manifest_pool(2, &dir);

        let a = pool.load_model(InstanceSelector::RoundRobin, "id").unwrap();
        let b = pool.load_model(InstanceSelector::RoundRobin, "id").unwrap();
        let c = pool.load_model(InstanceSelector::RoundRobin, "id").unwrap();
        assert_eq!(pool.instance_of(a), Some(0));
        assert_eq!(pool.instance_of(b), Some(1));
        assert_eq!(pool.instance_of(c), Some(0));
        assert_eq!(pool.loaded_models(), vec![a, b, c]);
        assert_eq!(pool.instance(0).unwrap().model_count().unwrap(), 2);

        assert!(matches!(
            pool.load_model(InstanceSelector::Index(5), "id"),
            Err(RuntimeError::InvalidInstance { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_metrics_track_calls() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("id.json"), r#"{"kind": "identity"}"#).unwrap();
        let pool = manifest_pool(1, &dir);

        let handle = pool.load_model(InstanceSelector::Index(0), "id").unwrap();
        assert!(pool.load_model(InstanceSelector::Index(0), "nope").is_err());
        pool.forward(handle, &Tensor::from_vec(vec![1.0])).unwrap();
        assert!(pool.forward(ModelHandle::from_raw(0), &Tensor::from_vec(vec![1.0])).is_err());

        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.instance_starts, 1);
        assert_eq!(snapshot.loads, 1);
        assert_eq!(snapshot.load_failures, 1);
        assert_eq!(snapshot.forwards, 1);
        // Unknown handles are rejected before reaching an instance.
        assert_eq!(snapshot.forward_failures, 0);
    }

    #[test]
    fn test_teardown_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let pool = manifest_pool(2, &dir);
        assert!(pool.shared_module_initialized());

        pool.teardown().unwrap();
        assert!(!pool.is_open());
        assert!(pool.shared_module().is_none());
        pool.teardown().unwrap();
        assert!(matches!(
            pool.load_model(InstanceSelector::Index(0), "id"),
            Err(RuntimeError::PoolClosed)
        ));
    }
}
