//! Instance selection for `load_model`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, RuntimeError};

/// Which instance a model should be loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSelector {
    /// A specific instance by creation index.
    Index(usize),
    /// The next instance in round-robin order.
    RoundRobin,
}

/// Round-robin cursor shared by all callers of one pool.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `selector` to an index in `0..count`.
    pub fn pick(&self, selector: InstanceSelector, count: usize) -> Result<usize> {
        match selector {
            InstanceSelector::Index(index) if index < count => Ok(index),
            InstanceSelector::Index(index) => Err(RuntimeError::InvalidInstance { index, count }),
            InstanceSelector::RoundRobin if count == 0 => {
                Err(RuntimeError::InvalidInstance { index: 0, count })
            }
            InstanceSelector::RoundRobin => Ok(self.next.fetch_add(1, Ordering::Relaxed) % count),
        }
    }
}
