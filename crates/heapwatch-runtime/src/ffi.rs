//! Heapwatch Runtime - C FFI wrapper
//!
//! Provides C-compatible functions for the write barrier, byref validation
//! and collector-side table maintenance. One process-wide runtime is
//! created by `hw_init` or `hw_init_json`.

use heapwatch::object::{MethodIdentity, TypeInfo, TypeRegistry};
use heapwatch::{HeapWatchConfig, HeapWatchError, Runtime, WriteBarrier};
use libc::c_char;
use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn install(config: HeapWatchConfig, heap_size: usize) -> bool {
    if INITIALIZED.load(Ordering::SeqCst) {
        return true;
    }

    match Runtime::new(config, heap_size, Arc::new(TypeRegistry::new())) {
        Ok(runtime) => {
            let _ = RUNTIME.set(runtime);
            INITIALIZED.store(true, Ordering::SeqCst);
            true
        }
        Err(e) => {
            log::error!("failed to create heapwatch runtime: {}", e);
            false
        }
    }
}

/// The process-wide runtime, once `hw_init` has succeeded
fn runtime() -> heapwatch::Result<&'static Arc<Runtime>> {
    RUNTIME.get().ok_or(HeapWatchError::NotInitialized)
}

/// Borrow a nullable C string as UTF-8
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller passes a NUL-terminated string that outlives the call.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// `Namespace.Type.Method`, or null for CALLI
unsafe fn method_from_c(ptr: *const c_char) -> Option<MethodIdentity> {
    // SAFETY: forwarded from the caller.
    unsafe { c_str(ptr) }.map(MethodIdentity::parse)
}

// ============================================================================
// INITIALIZATION
// ============================================================================

/// Create the runtime over a heap of `heap_size` bytes
///
/// Configuration comes from `HEAPWATCH_*` environment variables.
#[no_mangle]
pub extern "C" fn hw_init(heap_size: usize) -> bool {
    install(HeapWatchConfig::from_env(), heap_size)
}

/// Create the runtime from a JSON-encoded `HeapWatchConfig`
///
/// # Safety
/// `config` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_init_json(config: *const c_char, heap_size: usize) -> bool {
    if INITIALIZED.load(Ordering::SeqCst) {
        return true;
    }

    // SAFETY: forwarded from the caller.
    let Some(json) = (unsafe { c_str(config) }) else {
        return install(HeapWatchConfig::default(), heap_size);
    };

    match serde_json::from_str::<HeapWatchConfig>(json) {
        Ok(config) => install(config, heap_size),
        Err(e) => {
            log::error!("invalid heapwatch config: {}", e);
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn hw_is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

// ============================================================================
// TYPES AND ALLOCATION
// ============================================================================

/// Register a plain object type with `words` payload words
///
/// Bit `i` of `ref_mask` marks payload word `i` as a reference, so at most
/// 64 payload words can be described. Returns the method table address,
/// 0 on failure.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_register_object_type(
    name: *const c_char,
    words: usize,
    ref_mask: u64,
) -> usize {
    // SAFETY: forwarded from the caller.
    let name = unsafe { c_str(name) }.unwrap_or("<anonymous>");
    if words > REF_MASK_BITS {
        log::error!(
            "type {} has {} payload words, reference mask covers {}",
            name,
            words,
            REF_MASK_BITS
        );
        return 0;
    }
    let refs: Vec<usize> = (0..words)
        .filter(|i| ref_mask & (1 << i) != 0)
        .collect();
    register(TypeInfo::with_fields(name, words, &refs))
}

/// Register an array type
///
/// Returns the method table address, 0 on failure.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_register_array_type(
    name: *const c_char,
    component_size: usize,
    component_is_ref: bool,
) -> usize {
    // SAFETY: forwarded from the caller.
    let name = unsafe { c_str(name) }.unwrap_or("<anonymous>");
    let info = if component_is_ref {
        TypeInfo::reference_array(name)
    } else {
        TypeInfo::array(name, component_size)
    };
    register(info)
}

const REF_MASK_BITS: usize = u64::BITS as usize;

fn register(info: TypeInfo) -> usize {
    match runtime().and_then(|runtime| runtime.segment().types().register(info)) {
        Ok(mt) => mt.address(),
        Err(e) => {
            log::error!("type registration failed: {}", e);
            0
        }
    }
}

/// Allocate an object; returns null on failure
#[no_mangle]
pub extern "C" fn hw_alloc(method_table: usize, length: usize) -> *mut c_void {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("heapwatch allocation failed: {}", e);
            return std::ptr::null_mut();
        }
    };
    let Some(mt) = runtime.segment().types().method_table(method_table) else {
        log::error!("allocation with unknown method table {:#x}", method_table);
        return std::ptr::null_mut();
    };

    match runtime.segment().allocate(mt, length) {
        Ok(obj) => obj.address() as *mut c_void,
        Err(e) => {
            log::error!("heapwatch allocation failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

// ============================================================================
// WRITE BARRIER
// ============================================================================

/// Store `value` to an in-heap reference slot
///
/// # Safety
/// `dest` must be a valid, aligned slot inside the heap.
#[no_mangle]
pub unsafe extern "C" fn hw_write_barrier(dest: *mut usize, value: usize) {
    match RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        Some(runtime) => unsafe { runtime.barrier().write(dest, value) },
        None => unsafe { dest.write(value) },
    }
}

/// Store `value` to a slot that may be outside the heap
///
/// # Safety
/// `dest` must be a valid, aligned slot.
#[no_mangle]
pub unsafe extern "C" fn hw_checked_write_barrier(dest: *mut usize, value: usize) {
    match RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        Some(runtime) => unsafe { runtime.barrier().checked_write(dest, value) },
        None => unsafe { dest.write(value) },
    }
}

/// Copy the reference at `src` to `dest`
///
/// # Safety
/// `src` must be readable and `dest` a valid, aligned slot.
#[no_mangle]
pub unsafe extern "C" fn hw_byref_write_barrier(dest: *mut usize, src: *const usize) {
    match RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        Some(runtime) => unsafe { runtime.barrier().byref_write(dest, src) },
        None => unsafe { dest.write(src.read()) },
    }
}

/// Move `count` reference slots and mark the destination cards
///
/// # Safety
/// Both ranges must be valid for `count` words.
#[no_mangle]
pub unsafe extern "C" fn hw_bulk_copy(dest: *mut usize, src: *const usize, count: usize) {
    match RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        Some(runtime) => unsafe { runtime.barrier().bulk_copy(dest, src, count) },
        None => unsafe { std::ptr::copy(src, dest, count) },
    }
}

// ============================================================================
// COLLECTOR HOOKS
// ============================================================================

/// Publish a new ephemeral range; stops the world
#[no_mangle]
pub extern "C" fn hw_set_ephemeral_range(low: usize, high: usize) -> bool {
    match runtime().and_then(|runtime| runtime.set_ephemeral_range(low, high)) {
        Ok(()) => true,
        Err(e) => {
            log::error!("rejected ephemeral range: {}", e);
            false
        }
    }
}

/// Clear cards over `[start, end)`; returns how many were dirty
#[no_mangle]
pub extern "C" fn hw_clear_cards(start: usize, end: usize) -> usize {
    RUNTIME
        .get()
        .map_or(0, |runtime| runtime.clear_cards(start, end))
}

#[no_mangle]
pub extern "C" fn hw_is_card_dirty(addr: usize) -> bool {
    RUNTIME
        .get()
        .is_some_and(|runtime| runtime.barrier_state().cards().is_dirty(addr))
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Queue a byref passed to native code
///
/// # Safety
/// `method` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_validate_byref(
    pointer: *mut c_void,
    method: *const c_char,
    this: *mut c_void,
) {
    if let Some(runtime) = RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        let method = unsafe { method_from_c(method) };
        runtime
            .validator()
            .validate_byref(pointer as usize, method, this as usize);
    }
}

/// Validate a pinned object now
///
/// # Safety
/// `method` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_validate_object(
    object: *mut c_void,
    method: *const c_char,
    this: *mut c_void,
) {
    if let Some(runtime) = RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        let method = unsafe { method_from_c(method) };
        runtime
            .validator()
            .validate(object as usize, method, this as usize);
    }
}

/// Validate every queued byref; stops the world
#[no_mangle]
pub extern "C" fn hw_process_byref_validation_list() {
    if let Some(runtime) = RUNTIME.get() {
        runtime.collect();
    }
}

/// Trace an object pinned for an interop call
///
/// # Safety
/// `method` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hw_log_pinned_argument(method: *const c_char, object: *mut c_void) {
    if let Some(runtime) = RUNTIME.get() {
        // SAFETY: forwarded from the caller.
        let method = unsafe { method_from_c(method) };
        runtime
            .validator()
            .log_pinned_argument(method.as_ref(), object as usize);
    }
}
