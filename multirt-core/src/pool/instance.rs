//! One isolated engine replica behind its own lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::ModelHandle;
use crate::engine::{Engine, EngineError};
use crate::error::{Result, RuntimeError};
use crate::module::{ModuleTable, NativeModule};
use crate::resolver::{Importer, ResolverChain};

/// Everything an instance owns. Only reachable through
/// [`EngineInstance::lock`].
pub struct InstanceState<E: Engine> {
    pub(super) index: usize,
    pub(super) engine: E,
    chain: ResolverChain,
    modules: ModuleTable,
    pub(super) models: HashMap<ModelHandle, E::Object>,
}

impl<E: Engine> InstanceState<E> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Names of native modules imported so far.
    pub fn imported_modules(&self) -> Vec<String> {
        self.modules.names()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn resolver_labels(&self) -> Vec<&str> {
        self.chain.labels()
    }

    /// Split into the engine and an importer over this instance's chain.
    pub(super) fn split(&mut self) -> (&mut E, Importer<'_>) {
        (
            &mut self.engine,
            Importer::new(self.index, &self.chain, &mut self.modules),
        )
    }

    /// Like [`split`](Self::split), also lending the stored callables.
    pub(super) fn split_with_models(
        &mut self,
    ) -> (&mut E, Importer<'_>, &HashMap<ModelHandle, E::Object>) {
        (
            &mut self.engine,
            Importer::new(self.index, &self.chain, &mut self.modules),
            &self.models,
        )
    }
}

/// An engine replica plus the exclusive lock that guards it.
///
/// Every load and forward into the instance holds the lock for the whole
/// call; callers on other instances never contend with it.
pub struct EngineInstance<E: Engine> {
    index: usize,
    state: Mutex<InstanceState<E>>,
}

impl<E: Engine> EngineInstance<E> {
    /// Bootstrap `engine` and import the startup modules.
    ///
    /// `chain` must already contain the instance's resolvers, bridge first.
    pub fn create(
        index: usize,
        engine: E,
        chain: ResolverChain,
        bootstrap: &str,
        startup_modules: &[String],
    ) -> Result<Self> {
        let mut state = InstanceState {
            index,
            engine,
            chain,
            modules: ModuleTable::new(),
            models: HashMap::new(),
        };

        let init_failed =
            |e: EngineError| RuntimeError::Initialization(format!("engine instance {}: {}", index, e));
        {
            let (engine, mut importer) = state.split();
            engine.bootstrap(&mut importer, bootstrap).map_err(init_failed)?;
            for module in startup_modules {
                engine.import(&mut importer, module).map_err(init_failed)?;
            }
        }

        info!(
            instance = index,
            resolvers = ?state.resolver_labels(),
            modules = state.modules.len(),
            "Engine instance ready"
        );
        Ok(Self {
            index,
            state: Mutex::new(state),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Acquire the instance lock, blocking until it is free.
    pub fn lock(&self) -> Result<MutexGuard<'_, InstanceState<E>>> {
        self.state.lock().map_err(|_| RuntimeError::Poisoned(self.index))
    }

    /// The native module this instance has bound to `name`, if imported.
    pub fn module(&self, name: &str) -> Result<Option<NativeModule>> {
        Ok(self.lock()?.modules.get(name).cloned())
    }

    pub fn model_count(&self) -> Result<usize> {
        Ok(self.lock()?.models.len())
    }

    /// A poisoned instance still has to be torn down.
    fn teardown_state(&self) -> MutexGuard<'_, InstanceState<E>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop every model callable this instance holds. Returns how many.
    pub(super) fn release_models(&self) -> usize {
        let mut state = self.teardown_state();
        let released = state.models.len();
        state.models.clear();
        released
    }

    /// Finalize the engine, then drop its module references.
    ///
    /// Afterwards the instance holds no module references, so the shared
    /// module's last owner is the pool.
    pub(super) fn finalize_engine(&self) -> std::result::Result<(), EngineError> {
        let mut state = self.teardown_state();
        let outcome = state.engine.finalize();
        state.modules.clear();
        state.chain.clear();

        debug!(instance = self.index, "Engine instance finalized");
        outcome
    }
}
