//! Manifest Engine - Reference Engine Backed by JSON Model Manifests
//!
//! `ManifestEngine` is the engine the `multirt` binary, the C ABI and the test
//! suite run against. A model file is a small JSON manifest:
//!
//! ```json
//! { "kind": "scale", "factor": 2.0, "requires": ["tensor._C"], "delay_ms": 5 }
//! ```
//!
//! Loading follows the same path as any other engine: the instance imports the
//! `loader` native module, reads its `load` attribute, calls it with the model
//! path and keeps the returned model's `forward` attribute. Modules listed in
//! `requires` are imported into the instance while loading, so a model that
//! requires the tensor library attaches the shared singleton.
//!
//! Bootstrap scripts are line based:
//!
//! ```text
//! # comment
//! path ./models
//! import tensor._C
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{Arg, Engine, EngineError};
use crate::error::Result as RuntimeResult;
use crate::module::{ModuleInitError, NativeModule};
use crate::registry::NativeModuleRegistry;
use crate::resolver::Importer;
use crate::tensor::{Tensor, TensorLibrary};

/// Name of the native module exposing `load(path)`.
pub const LOADER_MODULE: &str = "loader";

/// Name of the shared tensor-library module.
pub const TENSOR_MODULE: &str = "tensor._C";

/// What a model computes in `forward`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    Identity,
    Scale { factor: f32 },
    Offset { value: f32 },
    /// Adds the number of forward calls made so far (including this one).
    Counter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    #[serde(flatten)]
    pub kind: ModelKind,
    /// Artificial work per forward call.
    #[serde(default)]
    pub delay_ms: u64,
    /// Modules imported into the instance when the model is loaded.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub fail_on_forward: bool,
}

/// Object behind the `loader` native module.
#[derive(Debug, Default)]
pub struct ManifestLoader;

impl ManifestLoader {
    pub fn init_module() -> Result<NativeModule, ModuleInitError> {
        Ok(NativeModule::new(LOADER_MODULE, ManifestLoader))
    }

    /// Locate a model file.
    ///
    /// Relative paths are tried as given, then under each search path; a
    /// path without extension also matches `<path>.json`.
    pub fn resolve(&self, path: &Path, search_paths: &[PathBuf]) -> Option<PathBuf> {
        let mut names = vec![path.to_path_buf()];
        if path.extension().is_none() {
            names.push(path.with_extension("json"));
        }

        let mut candidates = names.clone();
        if path.is_relative() {
            for dir in search_paths {
                candidates.extend(names.iter().map(|name| dir.join(name)));
            }
        }

        candidates.into_iter().find(|candidate| candidate.is_file())
    }

    pub fn read(&self, path: &Path, search_paths: &[PathBuf]) -> Result<(PathBuf, ModelManifest), EngineError> {
        let resolved = self
            .resolve(path, search_paths)
            .ok_or_else(|| EngineError::Raised(format!("model file {:?} not found", path)))?;

        let text = fs::read_to_string(&resolved)
            .map_err(|e| EngineError::Raised(format!("cannot read {:?}: {}", resolved, e)))?;
        let manifest = serde_json::from_str(&text)
            .map_err(|e| EngineError::Raised(format!("invalid model manifest {:?}: {}", resolved, e)))?;

        Ok((resolved, manifest))
    }
}

/// Register the `loader` module (per instance) and the tensor library
/// (singleton) that [`ManifestEngine`] relies on.
pub fn register_builtin_modules(registry: &mut NativeModuleRegistry) -> RuntimeResult<()> {
    registry.register(LOADER_MODULE, ManifestLoader::init_module)?;
    registry.register_singleton(TENSOR_MODULE, || TensorLibrary::init_module(TENSOR_MODULE))?;
    Ok(())
}

/// Objects in a [`ManifestEngine`]'s object graph.
#[derive(Debug, Clone)]
pub enum ManifestObject {
    Module(NativeModule),
    LoadFn(NativeModule),
    Model(usize),
    Forward(usize),
    Tensor(Tensor),
}

impl ManifestObject {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Module(_) => "module",
            Self::LoadFn(_) => "function",
            Self::Model(_) => "model",
            Self::Forward(_) => "method",
            Self::Tensor(_) => "tensor",
        }
    }
}

struct LoadedModel {
    manifest: ModelManifest,
    source: PathBuf,
    calls: u64,
    library: Option<NativeModule>,
}

pub struct ManifestEngine {
    index: usize,
    search_paths: Vec<PathBuf>,
    namespace: HashMap<String, NativeModule>,
    models: Vec<LoadedModel>,
    finalized: bool,
}

impl ManifestEngine {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            search_paths: Vec::new(),
            namespace: HashMap::new(),
            models: Vec::new(),
            finalized: false,
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Names bound in this engine's global namespace.
    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespace.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.finalized {
            return Err(EngineError::Raised(format!("engine {} is finalized", self.index)));
        }
        Ok(())
    }

    fn import_module(&mut self, importer: &mut Importer<'_>, module: &str) -> Result<NativeModule, EngineError> {
        self.ensure_live()?;
        match importer.import_native(module)? {
            Some(native) => {
                self.namespace.insert(module.to_owned(), native.clone());
                Ok(native)
            }
            None => Err(EngineError::Import {
                module: module.to_owned(),
                message: "no module with this name".to_owned(),
            }),
        }
    }

    fn load_model(
        &mut self,
        importer: &mut Importer<'_>,
        loader: &NativeModule,
        path: &Path,
    ) -> Result<ManifestObject, EngineError> {
        let loader = loader
            .downcast::<ManifestLoader>()
            .ok_or_else(|| EngineError::Raised(format!("'{}' is not a model loader", loader.name())))?;
        let (source, manifest) = loader.read(path, &self.search_paths)?;

        let mut library = None;
        for required in &manifest.requires {
            let module = self.import_module(importer, required)?;
            if required == TENSOR_MODULE {
                library = Some(module);
            }
        }

        info!(engine = self.index, model = ?source, kind = ?manifest.kind, "Model loaded");
        self.models.push(LoadedModel {
            manifest,
            source,
            calls: 0,
            library,
        });
        Ok(ManifestObject::Model(self.models.len() - 1))
    }

    fn run_forward(&mut self, model: usize, input: &Tensor) -> Result<Tensor, EngineError> {
        let model = self
            .models
            .get_mut(model)
            .ok_or_else(|| EngineError::Raised("model has been released".to_owned()))?;

        if model.manifest.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(model.manifest.delay_ms));
        }
        if model.manifest.fail_on_forward {
            return Err(EngineError::Raised(format!("forward of {:?} raised", model.source)));
        }

        model.calls += 1;
        let library = model
            .library
            .as_ref()
            .and_then(|module| module.downcast::<TensorLibrary>());

        let output = match &model.manifest.kind {
            ModelKind::Identity => input.clone(),
            ModelKind::Scale { factor } => match library {
                Some(lib) => lib.scale(input, *factor),
                None => input.map(|x| x * factor),
            },
            ModelKind::Offset { value } => match library {
                Some(lib) => lib.add_scalar(input, *value),
                None => input.map(|x| x + value),
            },
            ModelKind::Counter => {
                let calls = model.calls as f32;
                input.map(|x| x + calls)
            }
        };
        Ok(output)
    }
}

impl Engine for ManifestEngine {
    type Object = ManifestObject;

    fn bootstrap(&mut self, importer: &mut Importer<'_>, script: &str) -> Result<(), EngineError> {
        for (number, raw) in script.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fail = |message: String| EngineError::Bootstrap {
                line: number + 1,
                message,
            };
            match line.split_once(char::is_whitespace) {
                Some(("path", dir)) => {
                    debug!(engine = self.index, dir = dir.trim(), "Adding search path");
                    self.search_paths.push(PathBuf::from(dir.trim()));
                }
                Some(("import", module)) => {
                    self.import_module(importer, module.trim())
                        .map_err(|e| fail(e.to_string()))?;
                }
                _ => return Err(fail(format!("unknown directive '{}'", line))),
            }
        }
        Ok(())
    }

    fn import(&mut self, importer: &mut Importer<'_>, module: &str) -> Result<ManifestObject, EngineError> {
        self.import_module(importer, module).map(ManifestObject::Module)
    }

    fn get_attr(&mut self, object: &ManifestObject, attr: &str) -> Result<ManifestObject, EngineError> {
        match (object, attr) {
            (ManifestObject::Module(module), "load") if module.downcast::<ManifestLoader>().is_some() => {
                Ok(ManifestObject::LoadFn(module.clone()))
            }
            (ManifestObject::Model(index), "forward") => Ok(ManifestObject::Forward(*index)),
            _ => Err(EngineError::Attribute(attr.to_owned())),
        }
    }

    fn call(
        &mut self,
        importer: &mut Importer<'_>,
        callable: &ManifestObject,
        arg: Arg<'_>,
    ) -> Result<ManifestObject, EngineError> {
        self.ensure_live()?;
        match (callable, arg) {
            (ManifestObject::LoadFn(loader), Arg::Path(path)) => self.load_model(importer, loader, path),
            (ManifestObject::Forward(model), Arg::Tensor(input)) => {
                self.run_forward(*model, input).map(ManifestObject::Tensor)
            }
            (other, _) => Err(EngineError::Raised(format!(
                "'{}' object is not callable with {:?}",
                other.type_name(),
                arg
            ))),
        }
    }

    fn to_tensor(&mut self, object: &ManifestObject) -> Result<Tensor, EngineError> {
        match object {
            ManifestObject::Tensor(tensor) => Ok(tensor.clone()),
            other => Err(EngineError::NotATensor(other.type_name().to_owned())),
        }
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        if self.finalized {
            return Err(EngineError::Finalize(format!("engine {} finalized twice", self.index)));
        }
        debug!(engine = self.index, models = self.models.len(), "Finalizing engine");
        self.models.clear();
        self.namespace.clear();
        self.finalized = true;
        Ok(())
    }
}
