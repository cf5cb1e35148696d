//! Process-wide init state and the facade singleton.
//!
//! The first intercepted call (or the library constructor, whichever runs
//! first) performs initialization exactly once, guarded by an atomic state
//! machine. Calls arriving *from other threads* during init wait; calls
//! arriving *from the initializing thread itself* are the allocator asking
//! for memory mid-init and must fall through to the raw path instead of
//! deadlocking, so the initializing thread's identity is recorded.

use crate::config::Modes;
use crate::facade::ShadowHeap;
use crate::hook;
use crate::sync::RawMutex;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub const STATE_UNINIT: u8 = 0;
pub const STATE_INITIALIZING: u8 = 1;
pub const STATE_READY: u8 = 2;
pub const STATE_DISABLED: u8 = 3;

static INIT_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static INIT_THREAD: AtomicUsize = AtomicUsize::new(0);

struct FacadeHolder(UnsafeCell<ShadowHeap>);
unsafe impl Sync for FacadeHolder {}

static FACADE: FacadeHolder = FacadeHolder(UnsafeCell::new(ShadowHeap::new()));

/// Serialises intercepted calls across threads; the snapshots and the store
/// are not internally synchronised.
static FACADE_LOCK: RawMutex = RawMutex::new();

/// Library constructor -- runs before main() so the environment is
/// validated and the arena probed before the host program allocates.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        ensure_initialized();
    }
    init
};

#[inline]
fn thread_token() -> usize {
    unsafe { libc::pthread_self() as usize }
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

/// Run or wait for initialization.
///
/// Returns with state READY or DISABLED, except when called re-entrantly
/// from the initializing thread itself -- then the state is still
/// INITIALIZING and the caller must use the raw path.
///
/// # Safety
/// May be called from any thread at any time.
pub unsafe fn ensure_initialized() {
    match INIT_STATE.compare_exchange(
        STATE_UNINIT,
        STATE_INITIALIZING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => run_init(),
        Err(STATE_INITIALIZING) => {
            if INIT_THREAD.load(Ordering::Acquire) == thread_token() {
                // Nested call from inside init (dlsym, probe, store).
                return;
            }
            while INIT_STATE.load(Ordering::Acquire) == STATE_INITIALIZING {
                core::hint::spin_loop();
            }
        }
        Err(_) => {}
    }
}

#[cold]
#[inline(never)]
unsafe fn run_init() {
    INIT_THREAD.store(thread_token(), Ordering::Release);

    // Resolve the raw entry points first; everything below allocates
    // through them.
    hook::resolve();

    let facade = &mut *FACADE.0.get();
    facade.ensure_initialized();

    let next = if facade.modes.all_disabled() { STATE_DISABLED } else { STATE_READY };
    INIT_STATE.store(next, Ordering::Release);
}

/// Run `f` on the facade under the global lock.
///
/// # Safety
/// Only valid in state READY.
#[inline]
pub unsafe fn with_facade<R>(f: impl FnOnce(&mut ShadowHeap) -> R) -> R {
    FACADE_LOCK.lock();
    let result = f(&mut *FACADE.0.get());
    FACADE_LOCK.unlock();
    result
}

/// Shared view of the facade for introspection (tests, scenario drivers).
///
/// # Safety
/// The caller must not race intercepted calls that mutate the facade.
pub unsafe fn facade_ref() -> &'static ShadowHeap {
    &*FACADE.0.get()
}

/// Effective modes after init; [`Modes::all_disabled`] implies passthrough.
///
/// # Safety
/// Call after init completed.
pub unsafe fn effective_modes() -> Modes {
    facade_ref().modes
}
