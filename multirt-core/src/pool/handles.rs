//! Model handles and the handle → instance table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Opaque id of a loaded model.
///
/// Ids are positive, process-unique and never reused, even across pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild a handle from an id received over a boundary.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a handle's model lives.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub instance: usize,
    pub source: PathBuf,
    pub loaded_at: Instant,
}

/// Thread-safe map from handle to owning instance.
///
/// The model callable itself stays inside its instance; this table only
/// routes a handle to the right lock.
#[derive(Default)]
pub struct HandleTable {
    entries: RwLock<HashMap<ModelHandle, HandleEntry>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ModelHandle, instance: usize, source: &Path) {
        self.entries
            .write()
            .expect("handle table lock poisoned during insert")
            .insert(
                handle,
                HandleEntry {
                    instance,
                    source: source.to_path_buf(),
                    loaded_at: Instant::now(),
                },
            );
    }

    pub fn instance_of(&self, handle: ModelHandle) -> Option<usize> {
        self.entries
            .read()
            .expect("handle table lock poisoned during lookup")
            .get(&handle)
            .map(|entry| entry.instance)
    }

    pub fn entry(&self, handle: ModelHandle) -> Option<HandleEntry> {
        self.entries
            .read()
            .expect("handle table lock poisoned during lookup")
            .get(&handle)
            .cloned()
    }

    /// All live handles in ascending (load) order.
    pub fn handles(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<ModelHandle> = self
            .entries
            .read()
            .expect("handle table lock poisoned during handles")
            .keys()
            .copied()
            .collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("handle table lock poisoned during len")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self
            .entries
            .write()
            .expect("handle table lock poisoned during clear");
        let count = entries.len();
        entries.clear();
        count
    }
}
