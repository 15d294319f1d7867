//! Native module objects and the per-instance module table.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to initialize native module '{module}': {message}")]
pub struct ModuleInitError {
    pub module: String,
    pub message: String,
}

impl ModuleInitError {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
        }
    }
}

/// An initialized native module.
///
/// Cloning hands out another reference to the same module object; it never
/// re-runs the initializer. Engines recover the concrete object with
/// [`downcast`](Self::downcast).
#[derive(Clone)]
pub struct NativeModule {
    name: Arc<str>,
    object: Arc<dyn Any + Send + Sync>,
}

impl NativeModule {
    pub fn new<T>(name: &str, object: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            name: Arc::from(name),
            object: Arc::new(object),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }

    /// `true` when both values refer to the same module object.
    pub fn same_object(&self, other: &NativeModule) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }

    /// Number of live references to the module object.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.object)
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Modules already imported into one engine instance, keyed by name.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: HashMap<String, NativeModule>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&NativeModule> {
        self.modules.get(name)
    }

    /// Cache `module` under the name it was imported as, which may differ
    /// from the name its initializer gave it.
    pub fn insert(&mut self, name: &str, module: NativeModule) {
        self.modules.insert(name.to_owned(), module);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Imported module names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Drop every module reference held by this instance.
    pub fn clear(&mut self) {
        self.modules.clear();
    }
}
