//! Loading a model into a locked instance.

use std::path::Path;
use tracing::debug;

use super::instance::InstanceState;
use super::ModelHandle;
use crate::config::LoaderConfig;
use crate::engine::{Arg, Engine, EngineError};
use crate::error::{Result, RuntimeError};

/// Resolves the loader collaborator inside an instance and keeps the
/// returned model's forward callable.
#[derive(Debug, Clone, Default)]
pub struct ModelLoader {
    config: LoaderConfig,
}

impl ModelLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load `path` into `state`, which the caller has locked.
    ///
    /// On failure the instance is left as it was apart from whatever the
    /// engine imported along the way.
    pub fn load<E: Engine>(&self, state: &mut InstanceState<E>, path: &Path) -> Result<ModelHandle> {
        let instance = state.index;
        let forward = self.resolve_forward(state, path).map_err(|e| RuntimeError::ModelLoad {
            instance,
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let handle = ModelHandle::next();
        state.models.insert(handle, forward);
        debug!(instance, %handle, ?path, "Stored forward callable");
        Ok(handle)
    }

    fn resolve_forward<E: Engine>(
        &self,
        state: &mut InstanceState<E>,
        path: &Path,
    ) -> std::result::Result<E::Object, EngineError> {
        let (engine, mut importer) = state.split();
        let module = engine.import(&mut importer, &self.config.module)?;
        let load = engine.get_attr(&module, &self.config.entry)?;
        let model = engine.call(&mut importer, &load, Arg::Path(path))?;
        engine.get_attr(&model, &self.config.forward)
    }
}
