//! Module Resolution Chain
//!
//! Every engine instance resolves native imports through its own ordered
//! [`ResolverChain`]. Resolvers are tried front to back; the first one that
//! returns [`Resolution::Resolved`] wins, and a chain in which every resolver
//! declines leaves the import to the engine's own lookup.
//!
//! A freshly bootstrapped instance carries two resolvers:
//!
//! ```text
//! [0] SharedSingletonBridge   tensor library -> process-wide shared module
//! [1] RegistryResolver        any other registered module -> per-instance init
//! ```
//!
//! [`Importer`] sits in front of the chain and caches results in the
//! instance's [`ModuleTable`], so a module is resolved at most once per
//! instance.

mod singleton;

pub use singleton::{SharedModuleRecord, SharedSingletonBridge};

use std::sync::Arc;
use tracing::{debug, trace};

use crate::module::{ModuleInitError, ModuleTable, NativeModule};
use crate::registry::{NativeModuleRegistry, Routing};

/// Outcome of a single resolver attempt.
#[derive(Debug)]
pub enum Resolution {
    Resolved(NativeModule),
    /// Not this resolver's module; try the next one.
    Decline,
}

/// One link in an instance's resolution chain.
pub trait ModuleResolver: Send + Sync {
    /// Short identifier used in logs.
    fn label(&self) -> &str;

    fn try_resolve(&self, name: &str) -> Result<Resolution, ModuleInitError>;
}

/// Ordered list of resolvers owned by one engine instance.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ModuleResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `resolver` ahead of every existing resolver.
    pub fn install_front(&mut self, resolver: Box<dyn ModuleResolver>) {
        debug!(resolver = resolver.label(), "Installing resolver at chain front");
        self.resolvers.insert(0, resolver);
    }

    pub fn push(&mut self, resolver: Box<dyn ModuleResolver>) {
        self.resolvers.push(resolver);
    }

    /// Ask each resolver in order; `Ok(None)` when all of them decline.
    pub fn resolve(&self, name: &str) -> Result<Option<NativeModule>, ModuleInitError> {
        for resolver in &self.resolvers {
            match resolver.try_resolve(name)? {
                Resolution::Resolved(module) => {
                    trace!(module = name, resolver = resolver.label(), "Resolved");
                    return Ok(Some(module));
                }
                Resolution::Decline => continue,
            }
        }
        Ok(None)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.label()).collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Drop every resolver (and the references they hold).
    pub fn clear(&mut self) {
        self.resolvers.clear();
    }
}

/// Resolves per-instance registry entries by running their initializer.
///
/// Singleton-routed entries are always declined so that a chain missing the
/// bridge can never initialize the shared module a second time.
pub struct RegistryResolver {
    registry: Arc<NativeModuleRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<NativeModuleRegistry>) -> Self {
        Self { registry }
    }
}

impl ModuleResolver for RegistryResolver {
    fn label(&self) -> &str {
        "registry"
    }

    fn try_resolve(&self, name: &str) -> Result<Resolution, ModuleInitError> {
        match self.registry.lookup(name) {
            Some(entry) if entry.routing() == Routing::PerInstance => {
                debug!(module = name, "Initializing per-instance native module");
                entry.initialize().map(Resolution::Resolved)
            }
            _ => Ok(Resolution::Decline),
        }
    }
}

/// Import front-end handed to engines while they run inside an instance.
///
/// Borrowing the instance's chain and module table for the duration of one
/// engine call keeps both reachable only while the instance lock is held.
pub struct Importer<'a> {
    instance: usize,
    chain: &'a ResolverChain,
    modules: &'a mut ModuleTable,
}

impl<'a> Importer<'a> {
    pub fn new(instance: usize, chain: &'a ResolverChain, modules: &'a mut ModuleTable) -> Self {
        Self {
            instance,
            chain,
            modules,
        }
    }

    /// Index of the instance this importer belongs to.
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Import a native module, consulting the module table first.
    ///
    /// `Ok(None)` means no resolver knows the name; the engine may then fall
    /// back to its own (source) import mechanism.
    pub fn import_native(&mut self, name: &str) -> Result<Option<NativeModule>, ModuleInitError> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Some(module.clone()));
        }

        let resolved = self.chain.resolve(name)?;
        if let Some(module) = &resolved {
            debug!(instance = self.instance, module = name, "Native module imported");
            self.modules.insert(name, module.clone());
        }
        Ok(resolved)
    }

    pub fn is_imported(&self, name: &str) -> bool {
        self.modules.contains(name)
    }
}
