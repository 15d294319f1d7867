//! Pool lifecycle, isolation and error-path tests against the reference engine.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multirt_core::engine::manifest::{ManifestLoader, LOADER_MODULE, TENSOR_MODULE};
use multirt_core::engine::Arg;
use multirt_core::resolver::Importer;
use multirt_core::{
    Engine, EngineError, InstancePool, InstanceSelector, ManifestEngine, ModelHandle,
    NativeModuleRegistry, PoolConfig, RuntimeError, Tensor, TensorLibrary, FATAL_EXIT_CODE,
};
use tempfile::TempDir;

fn models_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let models = [
        ("identity_model.json", r#"{"kind": "identity", "requires": ["tensor._C"]}"#),
        ("counter.json", r#"{"kind": "counter"}"#),
        ("broken.json", r#"{"kind": "identity", "fail_on_forward": true}"#),
        ("slow.json", r#"{"kind": "identity", "delay_ms": 300}"#),
    ];
    for (name, body) in models {
        fs::write(dir.path().join(name), body).unwrap();
    }
    dir
}

/// Builtin modules, with the singleton initializer counting its runs.
fn counting_registry(runs: Arc<AtomicUsize>) -> NativeModuleRegistry {
    let mut registry = NativeModuleRegistry::new();
    registry.register(LOADER_MODULE, ManifestLoader::init_module).unwrap();
    registry
        .register_singleton(TENSOR_MODULE, move || {
            runs.fetch_add(1, Ordering::SeqCst);
            TensorLibrary::init_module(TENSOR_MODULE)
        })
        .unwrap();
    registry
}

fn pool_with(config: PoolConfig, runs: Arc<AtomicUsize>) -> InstancePool<ManifestEngine> {
    InstancePool::initialize(&config, counting_registry(runs), |i| Ok(ManifestEngine::new(i))).unwrap()
}

fn config_for(dir: &TempDir, instances: usize) -> PoolConfig {
    PoolConfig {
        instance_count: instances,
        search_paths: vec![dir.path().to_path_buf()],
        ..PoolConfig::default()
    }
}

#[test]
fn singleton_initializes_once_for_any_instance_count() {
    let dir = models_dir();
    for instances in 1..=4 {
        for parallel_startup in [false, true] {
            let runs = Arc::new(AtomicUsize::new(0));
            let config = PoolConfig {
                parallel_startup,
                ..config_for(&dir, instances)
            };
            let pool = pool_with(config, runs.clone());

            assert_eq!(pool.instance_count(), instances);
            assert!(pool.shared_module_initialized());
            for index in 0..instances {
                pool.load_model(InstanceSelector::Index(index), "identity_model").unwrap();
            }
            pool.teardown().unwrap();

            assert_eq!(runs.load(Ordering::SeqCst), 1, "instances = {}", instances);
        }
    }
}

#[test]
fn singleton_is_deferred_until_first_import() {
    let dir = models_dir();
    let runs = Arc::new(AtomicUsize::new(0));
    let config = PoolConfig {
        attach_singleton: false,
        ..config_for(&dir, 3)
    };
    let pool = pool_with(config, runs.clone());
    assert!(!pool.shared_module_initialized());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // counter.json does not require the tensor library.
    pool.load_model(InstanceSelector::Index(0), "counter").unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    pool.load_model(InstanceSelector::Index(1), "identity_model").unwrap();
    pool.load_model(InstanceSelector::Index(2), "identity_model").unwrap();
    assert!(pool.shared_module_initialized());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn shared_module_is_one_object_and_others_are_per_instance() {
    let dir = models_dir();
    let pool = pool_with(config_for(&dir, 2), Arc::new(AtomicUsize::new(0)));
    let (a, b) = (pool.instance(0).unwrap(), pool.instance(1).unwrap());

    let tensor_a = a.module(TENSOR_MODULE).unwrap().unwrap();
    let tensor_b = b.module(TENSOR_MODULE).unwrap().unwrap();
    assert!(tensor_a.same_object(&tensor_b));

    pool.load_model(InstanceSelector::Index(0), "counter").unwrap();
    pool.load_model(InstanceSelector::Index(1), "counter").unwrap();
    let loader_a = a.module(LOADER_MODULE).unwrap().unwrap();
    let loader_b = b.module(LOADER_MODULE).unwrap().unwrap();
    assert!(!loader_a.same_object(&loader_b));
}

#[test]
fn same_model_in_two_instances_is_isolated() {
    let dir = models_dir();
    let pool = pool_with(config_for(&dir, 2), Arc::new(AtomicUsize::new(0)));

    let h1 = pool.load_model(InstanceSelector::Index(0), "counter").unwrap();
    let h2 = pool.load_model(InstanceSelector::Index(1), "counter").unwrap();
    assert_ne!(h1, h2);
    assert_eq!(pool.instance_of(h1), Some(0));
    assert_eq!(pool.instance_of(h2), Some(1));

    let zero = Tensor::from_vec(vec![0.0]);
    for _ in 0..3 {
        pool.forward(h1, &zero).unwrap();
    }
    assert_eq!(pool.forward(h2, &zero).unwrap().data(), &[1.0]);
    assert_eq!(pool.forward(h1, &zero).unwrap().data(), &[4.0]);
}

#[test]
fn identity_round_trip_is_value_equal() {
    let dir = models_dir();
    let pool = pool_with(config_for(&dir, 1), Arc::new(AtomicUsize::new(0)));
    let handle = pool.load_model(InstanceSelector::RoundRobin, "identity_model").unwrap();

    let input = Tensor::new(vec![2, 3], vec![0.5, -1.0, 2.0, 3.25, 0.0, 7.0]).unwrap();
    let output = pool.forward(handle, &input).unwrap();
    assert_eq!(output, input);
    assert_eq!(output.shape(), &[2, 3]);
}

#[test]
fn handles_stay_valid_until_teardown() {
    let dir = models_dir();
    let pool = pool_with(config_for(&dir, 2), Arc::new(AtomicUsize::new(0)));
    let handle = pool.load_model(InstanceSelector::Index(1), "counter").unwrap();
    let input = Tensor::from_vec(vec![1.0]);

    // Loading more models does not invalidate earlier handles.
    for _ in 0..5 {
        pool.load_model(InstanceSelector::RoundRobin, "identity_model").unwrap();
    }
    assert!(pool.forward(handle, &input).is_ok());
    assert_eq!(pool.loaded_models().len(), 6);

    let never_issued = ModelHandle::from_raw(handle.get() + 1_000_000);
    assert!(matches!(
        pool.forward(never_issued, &input),
        Err(RuntimeError::UnknownHandle(h)) if h == never_issued
    ));

    pool.teardown().unwrap();
    assert!(pool.loaded_models().is_empty());
    assert!(matches!(pool.forward(handle, &input), Err(RuntimeError::PoolClosed)));
}

#[test]
fn load_and_invoke_errors_leave_instance_usable() {
    let dir = models_dir();
    let pool = pool_with(config_for(&dir, 1), Arc::new(AtomicUsize::new(0)));

    let err = pool.load_model(InstanceSelector::Index(0), "does_not_exist").unwrap_err();
    assert!(!err.is_fatal());
    match err {
        RuntimeError::ModelLoad { instance, path, message } => {
            assert_eq!(instance, 0);
            assert_eq!(path.to_str(), Some("does_not_exist"));
            assert!(message.contains("not found"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let broken = pool.load_model(InstanceSelector::Index(0), "broken").unwrap();
    let input = Tensor::from_vec(vec![1.0, 2.0]);
    assert!(matches!(
        pool.forward(broken, &input),
        Err(RuntimeError::ModelInvocation { handle, .. }) if handle == broken
    ));

    // The lock was released on both error paths.
    let identity = pool.load_model(InstanceSelector::Index(0), "identity_model").unwrap();
    assert_eq!(pool.forward(identity, &input).unwrap(), input);
}

#[test]
fn end_to_end_two_instances_two_threads() {
    let dir = models_dir();
    let pool = Arc::new(pool_with(config_for(&dir, 2), Arc::new(AtomicUsize::new(0))));

    let h1 = pool.load_model(InstanceSelector::Index(0), "identity_model").unwrap();
    let h2 = pool.load_model(InstanceSelector::Index(1), "identity_model").unwrap();
    let input = Tensor::from_vec(vec![1.0, 2.0, 3.0]);

    assert_eq!(pool.forward(h1, &input).unwrap(), input);
    assert_eq!(pool.forward(h2, &input).unwrap(), input);

    let workers: Vec<_> = [h1, h2]
        .into_iter()
        .map(|handle| {
            let pool = pool.clone();
            let input = input.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    assert_eq!(pool.forward(handle, &input).unwrap(), input);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    pool.teardown().unwrap();
}

#[test]
fn teardown_waits_for_in_flight_calls() {
    let dir = models_dir();
    let pool = Arc::new(pool_with(config_for(&dir, 1), Arc::new(AtomicUsize::new(0))));
    let slow = pool.load_model(InstanceSelector::Index(0), "slow").unwrap();

    let started = Instant::now();
    let in_flight = {
        let pool = pool.clone();
        thread::spawn(move || pool.forward(slow, &Tensor::from_vec(vec![1.0])))
    };
    thread::sleep(Duration::from_millis(100));

    pool.teardown().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(in_flight.join().unwrap().unwrap().data(), &[1.0]);
}

#[test]
fn registry_rejects_duplicates() {
    let mut registry = counting_registry(Arc::new(AtomicUsize::new(0)));
    let dup = registry.register(LOADER_MODULE, ManifestLoader::init_module).unwrap_err();
    assert!(dup.is_fatal());
    assert!(registry
        .register_singleton("other._C", || TensorLibrary::init_module("other._C"))
        .is_err());
}

#[test]
fn failed_bootstrap_aborts_initialization() {
    let config = PoolConfig {
        bootstrap: "import numpy\n".to_string(),
        ..PoolConfig::with_instances(2)
    };
    let err = InstancePool::initialize(
        &config,
        counting_registry(Arc::new(AtomicUsize::new(0))),
        |i| Ok(ManifestEngine::new(i)),
    )
    .err()
    .unwrap();
    assert!(matches!(err, RuntimeError::Initialization(_)));
}

/// Engine object that counts how many of its kind are alive.
struct Tracked(Arc<AtomicUsize>);

impl Tracked {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine that records the live object count each time it is finalized.
struct TrackingEngine {
    live: Arc<AtomicUsize>,
    live_at_finalize: Arc<Mutex<Vec<usize>>>,
    fail_finalize: bool,
}

impl Engine for TrackingEngine {
    type Object = Tracked;

    fn bootstrap(&mut self, _: &mut Importer<'_>, _: &str) -> Result<(), EngineError> {
        Ok(())
    }

    fn import(&mut self, _: &mut Importer<'_>, _: &str) -> Result<Tracked, EngineError> {
        Ok(Tracked::new(&self.live))
    }

    fn get_attr(&mut self, _: &Tracked, _: &str) -> Result<Tracked, EngineError> {
        Ok(Tracked::new(&self.live))
    }

    fn call(&mut self, _: &mut Importer<'_>, _: &Tracked, _: Arg<'_>) -> Result<Tracked, EngineError> {
        Ok(Tracked::new(&self.live))
    }

    fn to_tensor(&mut self, _: &Tracked) -> Result<Tensor, EngineError> {
        Ok(Tensor::from_vec(vec![0.0]))
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        self.live_at_finalize
            .lock()
            .unwrap()
            .push(self.live.load(Ordering::SeqCst));
        if self.fail_finalize {
            return Err(EngineError::Finalize("boom".to_string()));
        }
        Ok(())
    }
}

fn tracking_pool(
    fail_finalize: bool,
) -> (InstancePool<TrackingEngine>, Arc<AtomicUsize>, Arc<Mutex<Vec<usize>>>) {
    let live = Arc::new(AtomicUsize::new(0));
    let live_at_finalize = Arc::new(Mutex::new(Vec::new()));
    let pool = InstancePool::initialize(&PoolConfig::with_instances(2), NativeModuleRegistry::new(), |_| {
        Ok(TrackingEngine {
            live: live.clone(),
            live_at_finalize: live_at_finalize.clone(),
            fail_finalize,
        })
    })
    .unwrap();
    (pool, live, live_at_finalize)
}

#[test]
fn teardown_releases_every_callable_before_any_finalize() {
    let (pool, live, live_at_finalize) = tracking_pool(false);
    pool.load_model(InstanceSelector::Index(0), "a").unwrap();
    pool.load_model(InstanceSelector::Index(1), "b").unwrap();
    assert_eq!(live.load(Ordering::SeqCst), 2);

    pool.teardown().unwrap();
    assert_eq!(*live_at_finalize.lock().unwrap(), vec![0, 0]);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_teardown_is_fatal_and_reported_again() {
    let (pool, live, live_at_finalize) = tracking_pool(true);
    pool.load_model(InstanceSelector::Index(0), "a").unwrap();
    pool.load_model(InstanceSelector::Index(1), "b").unwrap();

    let first = pool.teardown().unwrap_err();
    assert!(first.is_fatal());
    let reason = match first {
        RuntimeError::Teardown(reason) => reason,
        other => panic!("unexpected error: {other}"),
    };
    assert!(reason.contains("instance 0: finalization failed: boom"));
    assert!(reason.contains("instance 1: finalization failed: boom"));
    assert_eq!(*live_at_finalize.lock().unwrap(), vec![0, 0]);
    assert_eq!(live.load(Ordering::SeqCst), 0);

    assert!(matches!(pool.teardown(), Err(RuntimeError::Teardown(r)) if r == reason));
    assert!(!pool.is_open());
    assert!(matches!(
        pool.load_model(InstanceSelector::Index(0), "c"),
        Err(RuntimeError::PoolClosed)
    ));
    // Engines are finalized once, not again on the second call or on drop.
    drop(pool);
    assert_eq!(live_at_finalize.lock().unwrap().len(), 2);
}

#[test]
fn dropping_pool_with_failed_finalize_exits_fatally() {
    const CHILD_ENV: &str = "MULTIRT_DROP_FAILURE_CHILD";
    if std::env::var_os(CHILD_ENV).is_some() {
        let (pool, _, _) = tracking_pool(true);
        pool.load_model(InstanceSelector::Index(0), "a").unwrap();
        drop(pool);
        return;
    }

    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "dropping_pool_with_failed_finalize_exits_fatally", "--nocapture"])
        .env(CHILD_ENV, "1")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(FATAL_EXIT_CODE));
}
