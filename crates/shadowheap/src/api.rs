//! The exported C allocator surface.
//!
//! Each entry point dispatches on the init state: READY routes through the
//! facade under the global lock, DISABLED is a plain passthrough, and
//! anything else initializes first. A call arriving on the initializing
//! thread itself (the allocator asking us for memory, e.g. from inside
//! dlsym) stays on the raw path with the reentrancy discipline of the hook
//! table.

use crate::hook;
use crate::init::{self, STATE_DISABLED, STATE_READY};
use core::ffi::c_void;
use core::ptr;

/// Dispatch macro: route to the facade when ready, otherwise initialize
/// and fall back to the raw path.
macro_rules! dispatch {
    ($facade_fn:expr, $raw_fn:expr) => {{
        match init::state() {
            STATE_READY => init::with_facade(|facade| $facade_fn(facade)),
            STATE_DISABLED => $raw_fn,
            _ => {
                init::ensure_initialized();
                match init::state() {
                    STATE_READY => init::with_facade(|facade| $facade_fn(facade)),
                    _ => $raw_fn,
                }
            }
        }
    }};
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    dispatch!(
        |facade: &mut crate::facade::ShadowHeap| facade.malloc(size) as *mut c_void,
        hook::malloc_recursive_checked(size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    dispatch!(
        |facade: &mut crate::facade::ShadowHeap| facade.calloc(nmemb, size) as *mut c_void,
        hook::calloc_recursive_checked(nmemb, size) as *mut c_void
    )
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // free(NULL) is legal, and the bootstrap buffer handed out before
    // symbol resolution must never reach the real free.
    if ptr.is_null() || hook::is_bootstrap_ptr(ptr as *mut u8) {
        return;
    }
    dispatch!(
        |facade: &mut crate::facade::ShadowHeap| facade.free(ptr as *mut u8),
        hook::raw_free(ptr as *mut u8)
    );
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // realloc() folds three operations into one symbol; the degenerate
    // forms are delegated before any shadowing happens.
    if ptr.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(ptr);
        return ptr::null_mut();
    }
    dispatch!(
        |facade: &mut crate::facade::ShadowHeap| facade.realloc(ptr as *mut u8, size)
            as *mut c_void,
        hook::raw_realloc(ptr as *mut u8, size) as *mut c_void
    )
}
