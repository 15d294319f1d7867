//! Boundary tensor type and the process-wide tensor library module.
//!
//! [`Tensor`] is the value exchanged with hosts: a shape plus a
//! reference-counted `f32` buffer. Cloning shares the buffer, equality compares
//! values.
//!
//! [`TensorLibrary`] is the object behind the singleton native module. Its
//! state (registered dtypes, op counters) is process-wide, which is why the
//! pool must never initialize it more than once.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

use crate::module::{ModuleInitError, NativeModule};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Dense `f32` tensor with shared storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Arc<Vec<f32>>,
}

/// Wire form of [`Tensor`], checked by [`Tensor::new`] on the way in.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = TensorError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::new(raw.shape, raw.data)
    }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: Arc::new(data),
        })
    }

    /// One-dimensional tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data: Arc::new(data),
        }
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: Arc::new(vec![value; len]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elementwise map into a fresh buffer with the same shape.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self {
            shape: self.shape.clone(),
            data: Arc::new(self.data.iter().copied().map(f).collect()),
        }
    }

    /// `true` when both tensors share the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Number of live references to the storage.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data.as_slice() == other.data.as_slice()
    }
}

/// Process-global state of the native tensor library.
pub struct TensorLibrary {
    dtypes: Vec<&'static str>,
    created_at: Instant,
    ops: AtomicU64,
}

impl TensorLibrary {
    pub fn new() -> Self {
        info!("Initializing native tensor library");
        Self {
            dtypes: vec!["float32"],
            created_at: Instant::now(),
            ops: AtomicU64::new(0),
        }
    }

    /// Native initializer suitable for [`NativeModuleRegistry::register_singleton`].
    ///
    /// [`NativeModuleRegistry::register_singleton`]: crate::registry::NativeModuleRegistry::register_singleton
    pub fn init_module(name: &str) -> Result<NativeModule, ModuleInitError> {
        Ok(NativeModule::new(name, Self::new()))
    }

    pub fn dtypes(&self) -> &[&'static str] {
        &self.dtypes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Total ops executed by every engine instance sharing this library.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn scale(&self, input: &Tensor, factor: f32) -> Tensor {
        self.ops.fetch_add(1, Ordering::Relaxed);
        input.map(|x| x * factor)
    }

    pub fn add_scalar(&self, input: &Tensor, value: f32) -> Tensor {
        self.ops.fetch_add(1, Ordering::Relaxed);
        input.map(|x| x + value)
    }
}

impl Default for TensorLibrary {
    fn default() -> Self {
        Self::new()
    }
}
