//! The hook table: raw entry points of the allocator being shadowed.
//!
//! Because this library exports `malloc`/`free`/`calloc`/`realloc` itself,
//! calling `libc::malloc` from inside it would loop straight back here. The
//! real implementations are resolved with `dlsym(RTLD_NEXT, ..)` and cached
//! in atomics.
//!
//! `dlsym` itself may allocate (glibc's dlerror machinery calls calloc), so
//! resolution runs under a thread-local nesting counter: a nested call that
//! arrives while the counter is up is the allocator asking *us* for memory
//! and must be answered without re-entering the shadow machinery.

use crate::diag::warn_line;
use core::cell::Cell;
use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Nesting depth of raw calls on this thread.
    static RECURSION: Cell<u32> = const { Cell::new(0) };
}

/// True while this thread is inside a raw allocator call.
///
/// If thread-local storage is unavailable (thread teardown), err on the side
/// of "nested" so the caller takes the raw path.
#[inline]
pub fn in_recursive_call() -> bool {
    RECURSION.try_with(|c| c.get() > 0).unwrap_or(true)
}

/// RAII bump of the nesting counter around a raw call.
struct RecursiveRegion;

impl RecursiveRegion {
    fn enter() -> RecursiveRegion {
        let _ = RECURSION.try_with(|c| c.set(c.get() + 1));
        RecursiveRegion
    }
}

impl Drop for RecursiveRegion {
    fn drop(&mut self) {
        let _ = RECURSION.try_with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// The loader may ask for zeroed memory before `dlsym` has produced the real
/// calloc. Those requests are answered from this static buffer; it is never
/// handed out again after resolution completes.
const BOOTSTRAP_BUF_SIZE: usize = 8192;
static mut BOOTSTRAP_BUF: [u8; BOOTSTRAP_BUF_SIZE] = [0u8; BOOTSTRAP_BUF_SIZE];

/// Whether `ptr` points into the bootstrap buffer; such pointers must never
/// reach the real free().
#[inline]
pub fn is_bootstrap_ptr(ptr: *mut u8) -> bool {
    let base = unsafe { core::ptr::addr_of!(BOOTSTRAP_BUF) as usize };
    (base..base + BOOTSTRAP_BUF_SIZE).contains(&(ptr as usize))
}

/// Whether the real calloc is known yet. Gates the bootstrap buffer: a
/// nested calloc before this point is dlsym bootstrapping itself.
#[inline]
pub fn is_resolved() -> bool {
    REAL_CALLOC.load(Ordering::Acquire) != 0
}

#[cold]
#[inline(never)]
unsafe fn resolve_slot(slot: &AtomicUsize, name: &CStr) -> usize {
    let addr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if addr.is_null() {
        // Without the real entry points nothing can be delegated; there is
        // no way to run at all.
        warn_line!("shadowheap: ERROR: dlsym(RTLD_NEXT) failed for a malloc symbol");
        libc::abort();
    }
    let val = addr as usize;
    let _ = slot.compare_exchange(0, val, Ordering::Release, Ordering::Acquire);
    slot.load(Ordering::Acquire)
}

/// Resolve all four symbols now. Idempotent; nested allocation requests
/// issued by `dlsym` itself are caught by the nesting counter.
pub unsafe fn resolve() {
    let _region = RecursiveRegion::enter();
    resolve_slot(&REAL_MALLOC, c"malloc");
    resolve_slot(&REAL_CALLOC, c"calloc");
    resolve_slot(&REAL_REALLOC, c"realloc");
    resolve_slot(&REAL_FREE, c"free");
}

#[inline]
unsafe fn slot_fn(slot: &AtomicUsize, name: &CStr) -> usize {
    let f = slot.load(Ordering::Acquire);
    if f != 0 {
        f
    } else {
        let _region = RecursiveRegion::enter();
        resolve_slot(slot, name)
    }
}

/// # Safety
/// Delegates to the underlying allocator.
#[inline]
pub unsafe fn raw_malloc(len: usize) -> *mut u8 {
    let f: MallocFn = core::mem::transmute(slot_fn(&REAL_MALLOC, c"malloc"));
    f(len) as *mut u8
}

/// # Safety
/// Delegates to the underlying allocator.
#[inline]
pub unsafe fn raw_calloc(cnt: usize, len: usize) -> *mut u8 {
    let f: CallocFn = core::mem::transmute(slot_fn(&REAL_CALLOC, c"calloc"));
    f(cnt, len) as *mut u8
}

/// # Safety
/// `ptr` must be null or a live allocation of the underlying allocator.
#[inline]
pub unsafe fn raw_realloc(ptr: *mut u8, len: usize) -> *mut u8 {
    let f: ReallocFn = core::mem::transmute(slot_fn(&REAL_REALLOC, c"realloc"));
    f(ptr as *mut c_void, len) as *mut u8
}

/// # Safety
/// `ptr` must be null or a live allocation of the underlying allocator.
#[inline]
pub unsafe fn raw_free(ptr: *mut u8) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    let f: FreeFn = core::mem::transmute(slot_fn(&REAL_FREE, c"free"));
    f(ptr as *mut c_void)
}

/// Raw malloc with the nesting discipline: a call arriving while already
/// nested is the allocator requesting internal memory (e.g. inside dlsym)
/// and goes straight through; otherwise the counter is held up for the
/// duration of the raw call.
///
/// # Safety
/// Delegates to the underlying allocator.
#[inline]
pub unsafe fn malloc_recursive_checked(len: usize) -> *mut u8 {
    if in_recursive_call() {
        raw_malloc(len)
    } else {
        let _region = RecursiveRegion::enter();
        raw_malloc(len)
    }
}

/// Raw calloc with the nesting discipline. A nested request before symbol
/// resolution completes is answered from the zeroed bootstrap buffer (the
/// loader invokes calloc from within dlsym); a nested request after
/// resolution gets null.
///
/// # Safety
/// Delegates to the underlying allocator.
#[inline]
pub unsafe fn calloc_recursive_checked(cnt: usize, len: usize) -> *mut u8 {
    if in_recursive_call() {
        if !is_resolved() {
            core::ptr::addr_of_mut!(BOOTSTRAP_BUF) as *mut u8
        } else {
            ptr::null_mut()
        }
    } else {
        let _region = RecursiveRegion::enter();
        raw_calloc(cnt, len)
    }
}
