//! Shared singleton module and the resolver that routes imports to it.
//!
//! The tensor library keeps allocator pools and type tables in process-global
//! native state. Running its initializer once per engine instance would reset
//! or duplicate that state, so every instance must see the *same* module
//! object.
//!
//! [`SharedModuleRecord`] is the process-wide slot for that object. It is
//! backed by [`OnceLock`], which doubles as the one-shot guard: when two
//! instances hit their first import on two threads at the same time, one runs
//! the initializer and the other blocks until the result is published.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::{ModuleResolver, Resolution};
use crate::module::{ModuleInitError, NativeModule};
use crate::registry::NativeInitFn;

/// Lazily created, process-wide module slot.
///
/// The initializer outcome is cached, including a failure or a panic: the
/// initializer runs at most once no matter how many instances import the
/// module.
pub struct SharedModuleRecord {
    name: String,
    init: NativeInitFn,
    cell: OnceLock<Result<NativeModule, ModuleInitError>>,
    attachments: AtomicUsize,
}

impl SharedModuleRecord {
    pub fn new(name: impl Into<String>, init: NativeInitFn) -> Self {
        let name = name.into();
        debug!(module = %name, "Creating shared module record (deferred)");
        Self {
            name,
            init,
            cell: OnceLock::new(),
            attachments: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the shared module, running the native initializer on first use.
    pub fn get_or_init(&self) -> Result<NativeModule, ModuleInitError> {
        let outcome = self.cell.get_or_init(|| {
            info!(module = %self.name, "Initializing shared native module");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.init)()))
                .unwrap_or_else(|payload| {
                    Err(ModuleInitError::new(
                        self.name.as_str(),
                        format!("initializer panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
            if let Err(e) = &outcome {
                warn!(module = %self.name, error = %e, "Shared module initializer failed");
            }
            outcome
        });
        if outcome.is_ok() {
            self.attachments.fetch_add(1, Ordering::Relaxed);
        }
        outcome.clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }

    /// How many times the module has been handed to an instance.
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Relaxed)
    }

    /// Consume the record, returning the module if it was ever created.
    pub fn into_inner(self) -> Option<NativeModule> {
        self.cell.into_inner().and_then(Result::ok)
    }
}

fn panic_message<'a>(payload: &'a (dyn std::any::Any + Send + 'static)) -> &'a str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Resolver installed at the front of every instance's chain.
///
/// Resolves exactly one name, the singleton module, and declines the rest so
/// that all other native modules stay isolated per instance.
pub struct SharedSingletonBridge {
    record: Arc<SharedModuleRecord>,
}

impl SharedSingletonBridge {
    pub fn new(record: Arc<SharedModuleRecord>) -> Self {
        Self { record }
    }
}

impl ModuleResolver for SharedSingletonBridge {
    fn label(&self) -> &str {
        "shared-singleton"
    }

    fn try_resolve(&self, name: &str) -> Result<Resolution, ModuleInitError> {
        if name != self.record.name() {
            return Ok(Resolution::Decline);
        }
        self.record.get_or_init().map(Resolution::Resolved)
    }
}
