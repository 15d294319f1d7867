//! FFI Bridge - C ABI for Embedding Hosts
//!
//! Exposes the pool to non-Rust hosts as four functions over one
//! process-global pool of [`ManifestEngine`]s:
//!
//! ```c
//! int multirt_initialize(unsigned instances, const char *search_path);
//! int multirt_load_model(int instance, const char *path, uint64_t *handle);
//! int multirt_forward(uint64_t handle, const float *input, size_t len,
//!                     float *output, size_t capacity, size_t *written);
//! int multirt_teardown(void);
//! ```
//!
//! Tensors cross the boundary as flat `f32` buffers. The pool can be
//! initialized once per process; after teardown every call reports
//! [`FFI_CLOSED`]. A teardown failure terminates the process with
//! [`FATAL_EXIT_CODE`].

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tracing::{error, warn};

use crate::config::PoolConfig;
use crate::engine::manifest::register_builtin_modules;
use crate::engine::ManifestEngine;
use crate::error::{RuntimeError, FATAL_EXIT_CODE};
use crate::pool::{InstancePool, InstanceSelector, ModelHandle};
use crate::registry::NativeModuleRegistry;
use crate::tensor::Tensor;

/// C-compatible result code
pub type FfiResult = c_int;

pub const FFI_SUCCESS: FfiResult = 0;
pub const FFI_ERROR: FfiResult = -1;
pub const FFI_UNKNOWN_HANDLE: FfiResult = -2;
pub const FFI_NOT_INITIALIZED: FfiResult = -3;
pub const FFI_CLOSED: FfiResult = -4;
/// `*written` holds the required capacity.
pub const FFI_BUFFER_TOO_SMALL: FfiResult = -5;
pub const FFI_INVALID_ARGUMENT: FfiResult = -6;

static POOL: OnceLock<InstancePool<ManifestEngine>> = OnceLock::new();
static INIT_GUARD: Mutex<()> = Mutex::new(());

fn result_code(err: &RuntimeError) -> FfiResult {
    match err {
        RuntimeError::UnknownHandle(_) => FFI_UNKNOWN_HANDLE,
        RuntimeError::PoolClosed => FFI_CLOSED,
        RuntimeError::InvalidInstance { .. } => FFI_INVALID_ARGUMENT,
        _ => FFI_ERROR,
    }
}

unsafe fn path_arg(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(PathBuf::from)
}

/// Create the process-global pool.
///
/// A failed initialization terminates the process with [`FATAL_EXIT_CODE`].
///
/// # Safety
/// `search_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn multirt_initialize(instances: c_uint, search_path: *const c_char) -> FfiResult {
    let _guard = INIT_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if POOL.get().is_some() {
        warn!("multirt_initialize called more than once");
        return FFI_ERROR;
    }

    let mut config = PoolConfig::with_instances(instances as usize);
    if let Some(dir) = path_arg(search_path) {
        config.search_paths = vec![dir];
    }

    let mut registry = NativeModuleRegistry::new();
    let pool = register_builtin_modules(&mut registry)
        .and_then(|_| InstancePool::initialize(&config, registry, |index| Ok(ManifestEngine::new(index))));
    match pool {
        Ok(pool) => {
            // Guarded by INIT_GUARD, so the cell is still empty.
            let _ = POOL.set(pool);
            FFI_SUCCESS
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "Pool initialization failed");
            std::process::exit(FATAL_EXIT_CODE);
        }
        Err(e) => {
            error!(error = %e, "Pool initialization failed");
            FFI_ERROR
        }
    }
}

/// Load a model; `instance < 0` selects round-robin.
///
/// # Safety
/// `path` must be a valid NUL-terminated string and `handle_out` a valid
/// pointer to a `u64`.
#[no_mangle]
pub unsafe extern "C" fn multirt_load_model(
    instance: c_int,
    path: *const c_char,
    handle_out: *mut u64,
) -> FfiResult {
    let Some(pool) = POOL.get() else {
        return FFI_NOT_INITIALIZED;
    };
    let Some(path) = path_arg(path) else {
        return FFI_INVALID_ARGUMENT;
    };
    if handle_out.is_null() {
        return FFI_INVALID_ARGUMENT;
    }

    let selector = if instance < 0 {
        InstanceSelector::RoundRobin
    } else {
        InstanceSelector::Index(instance as usize)
    };
    match pool.load_model(selector, &path) {
        Ok(handle) => {
            *handle_out = handle.get();
            FFI_SUCCESS
        }
        Err(e) => {
            warn!(error = %e, "multirt_load_model failed");
            result_code(&e)
        }
    }
}

/// Run a model on a flat input buffer.
///
/// # Safety
/// `input` must point to `len` floats, `output` to `capacity` writable
/// floats (it may be null when `capacity` is 0) and `written` to a `usize`.
#[no_mangle]
pub unsafe extern "C" fn multirt_forward(
    handle: u64,
    input: *const f32,
    len: usize,
    output: *mut f32,
    capacity: usize,
    written: *mut usize,
) -> FfiResult {
    let Some(pool) = POOL.get() else {
        return FFI_NOT_INITIALIZED;
    };
    if written.is_null() || (input.is_null() && len > 0) || (output.is_null() && capacity > 0) {
        return FFI_INVALID_ARGUMENT;
    }

    let data = if len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(input, len).to_vec()
    };
    let result = match pool.forward(ModelHandle::from_raw(handle), &Tensor::from_vec(data)) {
        Ok(result) => result,
        Err(e) => return result_code(&e),
    };

    *written = result.len();
    if result.len() > capacity {
        return FFI_BUFFER_TOO_SMALL;
    }
    if !result.is_empty() {
        std::slice::from_raw_parts_mut(output, result.len()).copy_from_slice(result.data());
    }
    FFI_SUCCESS
}

/// Tear the global pool down; a second call is a no-op.
///
/// Terminates the process with [`FATAL_EXIT_CODE`] if finalization fails.
#[no_mangle]
pub extern "C" fn multirt_teardown() -> FfiResult {
    let Some(pool) = POOL.get() else {
        return FFI_NOT_INITIALIZED;
    };
    match pool.teardown() {
        Ok(()) => FFI_SUCCESS,
        Err(e) => {
            error!(error = %e, "Teardown failed, terminating");
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::fs;

    #[test]
    fn test_ffi_constants() {
        assert_eq!(FFI_SUCCESS, 0);
        assert_eq!(FFI_ERROR, -1);
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(result_code(&RuntimeError::UnknownHandle(ModelHandle::from_raw(9))), FFI_UNKNOWN_HANDLE);
        assert_eq!(result_code(&RuntimeError::PoolClosed), FFI_CLOSED);
        assert_eq!(result_code(&RuntimeError::TaskFailed("x".into())), FFI_ERROR);
    }

    // The global pool exists once per test binary, so the whole lifecycle
    // lives in a single test.
    #[test]
    fn test_global_pool_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("double.json"), r#"{"kind": "scale", "factor": 2.0}"#).unwrap();
        let search = CString::new(dir.path().to_str().unwrap()).unwrap();
        let model = CString::new("double").unwrap();
        let missing = CString::new("missing").unwrap();

        unsafe {
            let mut handle = 0u64;
            assert_eq!(multirt_load_model(0, model.as_ptr(), &mut handle), FFI_NOT_INITIALIZED);

            assert_eq!(multirt_initialize(2, search.as_ptr()), FFI_SUCCESS);
            assert_eq!(multirt_initialize(2, search.as_ptr()), FFI_ERROR);

            assert_eq!(multirt_load_model(-1, model.as_ptr(), &mut handle), FFI_SUCCESS);
            assert!(handle > 0);
            assert_eq!(multirt_load_model(1, missing.as_ptr(), &mut handle), FFI_ERROR);
            assert_eq!(multirt_load_model(7, model.as_ptr(), &mut handle), FFI_INVALID_ARGUMENT);

            let input = [1.0f32, 2.0, 3.0];
            let mut output = [0.0f32; 3];
            let mut written = 0usize;
            assert_eq!(
                multirt_forward(handle, input.as_ptr(), 3, output.as_mut_ptr(), 3, &mut written),
                FFI_SUCCESS
            );
            assert_eq!(written, 3);
            assert_eq!(output, [2.0, 4.0, 6.0]);

            assert_eq!(
                multirt_forward(handle, input.as_ptr(), 3, output.as_mut_ptr(), 2, &mut written),
                FFI_BUFFER_TOO_SMALL
            );
            assert_eq!(written, 3);
            assert_eq!(
                multirt_forward(0, input.as_ptr(), 3, output.as_mut_ptr(), 3, &mut written),
                FFI_UNKNOWN_HANDLE
            );

            assert_eq!(multirt_teardown(), FFI_SUCCESS);
            assert_eq!(multirt_teardown(), FFI_SUCCESS);
            assert_eq!(
                multirt_forward(handle, input.as_ptr(), 3, output.as_mut_ptr(), 3, &mut written),
                FFI_CLOSED
            );
        }
    }
}
