//! Native Module Registry - Process-Wide Catalog of Extension Initializers
//!
//! The registry maps extension-module names to their native initializer
//! functions. It is filled once while the host starts up and then handed to
//! the [`InstancePool`](crate::pool::InstancePool) behind an `Arc`, which makes
//! it read-only for the rest of the process: nothing can register a module
//! once engine instances exist.
//!
//! Entries come in two flavours:
//! - **per-instance** entries, whose initializer runs once inside every engine
//!   instance that imports them, keeping their module state isolated;
//! - one **singleton** entry (the tensor library), whose initializer must run
//!   at most once per process and which is routed through the
//!   [`SharedSingletonBridge`](crate::resolver::SharedSingletonBridge).
//!
//! Initializers can be Rust closures or C-ABI symbols resolved from a shared
//! library with `libloading`.

pub mod catalog;

use anyhow::{Context, Result as AnyResult};
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::module::{ModuleInitError, NativeModule};

/// Initializer producing a fresh module object each time it is invoked.
pub type NativeInitFn = Arc<dyn Fn() -> std::result::Result<NativeModule, ModuleInitError> + Send + Sync>;

/// C-ABI initializer exported by a native extension library.
///
/// Returns an opaque module pointer, or null on failure.
type RawInitFn = unsafe extern "C" fn() -> *mut c_void;

/// How imports of a registered module are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Initialized separately inside every importing instance.
    PerInstance,
    /// Initialized once per process and shared by every instance.
    Singleton,
}

/// One registered module.
#[derive(Clone)]
pub struct RegistryEntry {
    name: String,
    init: NativeInitFn,
    routing: Routing,
    source: Option<PathBuf>,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Shared library the initializer came from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Run the native initializer.
    pub fn initialize(&self) -> std::result::Result<NativeModule, ModuleInitError> {
        (self.init)()
    }

    pub(crate) fn init_fn(&self) -> NativeInitFn {
        self.init.clone()
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("routing", &self.routing)
            .field("source", &self.source)
            .finish()
    }
}

/// Module object returned by a C-ABI initializer.
///
/// Keeps the originating library mapped for as long as the module lives.
pub struct RawModule {
    ptr: NonNull<c_void>,
    _library: Arc<Library>,
}

// SAFETY: the pointer is an opaque handle owned by the native library. The
// runtime never dereferences it; engines that do are responsible for holding
// their instance lock while doing so.
unsafe impl Send for RawModule {}
unsafe impl Sync for RawModule {}

impl RawModule {
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

/// Registry of native extension initializers
pub struct NativeModuleRegistry {
    entries: HashMap<String, RegistryEntry>,
    singleton: Option<String>,
    /// Libraries opened with global symbol visibility (kept mapped)
    preloaded: Vec<Arc<Library>>,
}

impl NativeModuleRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            singleton: None,
            preloaded: Vec::new(),
        }
    }

    /// Register a per-instance module.
    ///
    /// Registering the same name twice is a programming error and fails
    /// with [`RuntimeError::Initialization`].
    pub fn register<F>(&mut self, name: impl Into<String>, init: F) -> Result<()>
    where
        F: Fn() -> std::result::Result<NativeModule, ModuleInitError> + Send + Sync + 'static,
    {
        self.insert(name.into(), Arc::new(init), Routing::PerInstance, None)
    }

    /// Register the module that is initialized once and shared by all instances.
    ///
    /// Only one singleton entry may exist.
    pub fn register_singleton<F>(&mut self, name: impl Into<String>, init: F) -> Result<()>
    where
        F: Fn() -> std::result::Result<NativeModule, ModuleInitError> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(existing) = &self.singleton {
            return Err(RuntimeError::Initialization(format!(
                "cannot mark '{}' as singleton: '{}' already is",
                name, existing
            )));
        }
        self.insert(name.clone(), Arc::new(init), Routing::Singleton, None)?;
        self.singleton = Some(name);
        Ok(())
    }

    fn insert(
        &mut self,
        name: String,
        init: NativeInitFn,
        routing: Routing,
        source: Option<PathBuf>,
    ) -> Result<()> {
        if self.entries.contains_key(&name) {
            return Err(RuntimeError::Initialization(format!(
                "native module '{}' registered twice",
                name
            )));
        }
        debug!(module = %name, ?routing, "Registering native module");
        self.entries.insert(
            name.clone(),
            RegistryEntry {
                name,
                init,
                routing,
                source,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    /// The singleton-routed entry, if one was registered.
    pub fn singleton(&self) -> Option<&RegistryEntry> {
        self.singleton.as_deref().and_then(|name| self.entries.get(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of libraries mapped through [`preload_global`](Self::preload_global).
    pub fn preloaded_count(&self) -> usize {
        self.preloaded.len()
    }

    /// Map a shared library with global symbol visibility.
    ///
    /// Some native extensions depend on symbols (compression, BLAS) that must
    /// already be loaded globally before their own library is opened.
    pub fn preload_global(&mut self, path: &Path) -> AnyResult<()> {
        info!("Preloading {:?} with global symbol visibility", path);

        #[cfg(unix)]
        let library: Library = unsafe {
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LAZY};
            UnixLibrary::open(Some(path), RTLD_GLOBAL | RTLD_LAZY)
                .with_context(|| format!("Failed to preload library {:?}", path))?
                .into()
        };

        #[cfg(not(unix))]
        let library = unsafe {
            Library::new(path).with_context(|| format!("Failed to preload library {:?}", path))?
        };

        self.preloaded.push(Arc::new(library));
        Ok(())
    }

    /// Register per-instance modules exported by one shared library.
    ///
    /// For every name, the symbol `<symbol_prefix><name>` must be a C-ABI
    /// function returning an opaque module pointer. Returns the number of modules registered.
    pub fn register_library(
        &mut self,
        path: &Path,
        names: &[&str],
        symbol_prefix: &str,
    ) -> AnyResult<usize> {
        info!("Registering {} native modules from {:?}", names.len(), path);

        let library = Arc::new(unsafe {
            Library::new(path).with_context(|| format!("Failed to load library from {:?}", path))?
        });

        for name in names {
            let symbol = format!("{}{}", symbol_prefix, name);
            let raw_init: RawInitFn = unsafe {
                *library
                    .get::<RawInitFn>(symbol.as_bytes())
                    .with_context(|| format!("Library {:?} missing '{}' export", path, symbol))?
            };

            let module_name = (*name).to_string();
            let keep_alive = library.clone();
            let init: NativeInitFn = Arc::new(move || {
                // SAFETY: the symbol was resolved from `keep_alive`, which stays
                // mapped for the lifetime of this closure.
                let ptr = unsafe { raw_init() };
                NonNull::new(ptr)
                    .map(|ptr| {
                        NativeModule::new(
                            &module_name,
                            RawModule {
                                ptr,
                                _library: keep_alive.clone(),
                            },
                        )
                    })
                    .ok_or_else(|| ModuleInitError::new(&module_name, "initializer returned null"))
            });

            self.insert(
                (*name).to_string(),
                init,
                Routing::PerInstance,
                Some(path.to_path_buf()),
            )?;
        }

        Ok(names.len())
    }
}

impl Default for NativeModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
