//! The interceptor facade.
//!
//! Owns the mode flags, the arena record, the snapshot buffers and the
//! metadata store, and sequences every intercepted call:
//!
//! ```text
//! verify prior state (top, unsorted, tcache, per-pointer)
//!   -> raw allocator call
//!   -> record new state (per-pointer, tcache, unsorted, top)
//! ```
//!
//! A failed verification emits its diagnostic and raises `SIGILL` from
//! here; the call never proceeds into the corrupted allocator.

use crate::chunk::{ChunkHeader, ChunkMeta};
use crate::config::{self, Modes};
use crate::diag::{info_line, raise_sigill, warn_line};
use crate::hook;
use crate::probe::{self, ArenaInfo};
use crate::shadow::ShadowData;
use crate::store::{CachedStore, HookAllocator, MetaStore, OrderedStore};

/// The default store: the two-layer cache over the ordered fallback, both
/// allocating through the raw hook.
pub type DefaultStore = CachedStore<OrderedStore<HookAllocator>, HookAllocator>;

pub struct ShadowHeap {
    initialized: bool,
    pub modes: Modes,
    pub arena: ArenaInfo,
    data: ShadowData,
    /// Created lazily during init; absent when per-pointer checking is off.
    store: Option<DefaultStore>,
}

impl ShadowHeap {
    pub const fn new() -> Self {
        ShadowHeap {
            initialized: false,
            modes: Modes::compiled_in(),
            arena: ArenaInfo::INVALID,
            data: ShadowData::new(),
            store: None,
        }
    }

    /// One-time setup: read the environment, build the store, run the
    /// arena probe. The probe fails closed -- on an unknown allocator the
    /// arena-dependent modes are dropped and the rest keeps running.
    ///
    /// # Safety
    /// Must run during single-threaded init, after the hook table resolved.
    pub unsafe fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }

        self.modes = config::read_modes();

        if self.modes.ptr {
            let mut store = DefaultStore::default();
            if self.modes.initial_store_size > 0 {
                store.reserve(self.modes.initial_store_size);
            }
            self.store = Some(store);
        }

        self.arena = probe::discover(self.modes.leak);
        if !self.arena.valid {
            self.modes.top = false;
            self.modes.usb = false;
            self.modes.tca = false;
            self.modes.leak = false;
        }
        // Without a tcache address there is nothing to mirror.
        if self.modes.tca && self.arena.tcache_base.is_null() {
            self.modes.tca = false;
        }

        info_line!("----------------------------------");
        info_line!("PTR Mode     : {}", self.modes.ptr);
        info_line!("TOP Mode     : {}", self.modes.top);
        info_line!("USB Mode     : {}", self.modes.usb);
        info_line!("TCA Mode     : {}", self.modes.tca);
        info_line!("LEAK Mode    : {}", self.modes.leak);
        probe::log_arena_info(&self.arena);
        info_line!("----------------------------------");

        self.initialized = true;
    }

    /// Number of live entries in the metadata store, for introspection.
    pub fn store_len(&self) -> usize {
        self.store.as_ref().map_or(0, |store| store.len())
    }

    // ------------------------------------------------------------------
    // Check / snapshot halves
    // ------------------------------------------------------------------

    unsafe fn pre_checks(&mut self) {
        if self.modes.top && self.data.check_topchunk(&self.arena.arena).is_err() {
            raise_sigill();
        }
        if self.modes.usb && self.data.check_unsorted(&self.arena.arena).is_err() {
            raise_sigill();
        }
        if self.modes.tca && self.data.check_tcache(&self.arena.tcache()).is_err() {
            raise_sigill();
        }
    }

    unsafe fn post_snapshots(&mut self) {
        if self.modes.tca {
            self.data.store_tcache(&self.arena.tcache());
        }
        if self.modes.usb {
            self.data.store_unsorted(&self.arena.arena);
        }
        if self.modes.top {
            self.data.store_topchunk(&self.arena.arena);
        }
    }

    unsafe fn store_pointer(&mut self, ret: *mut u8) {
        if !self.modes.ptr {
            return;
        }
        if let Some(store) = self.store.as_mut() {
            let header = ChunkHeader::from_user_ptr(ret);
            store.put(ChunkMeta::from_header(header));
        }
    }

    /// Compare the chunk header against the mirrored entry and drop the
    /// entry. Either a mismatch or a missing entry is fatal: both mean the
    /// header no longer says what the allocator once returned.
    unsafe fn check_pointer_before_free(&mut self, ptr: *mut u8) {
        if !self.modes.ptr {
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };

        let header = ChunkHeader::from_user_ptr(ptr);
        let meta = ChunkMeta::from_header(header);
        let stored = store.get(ptr);

        // Only pointer and logical size can be compared: the neighbour's
        // coalescing state flips PREV_INUSE underneath live chunks.
        if !stored.eq_ptr_size(meta) {
            let prev = header.prev_chunk();
            let prev_stored = store.get(prev.user_ptr());
            warn_line!(
                "FREE    (CHK ) Prev was: {:p} sz:{:#x} ptr:{:p}",
                prev.user_ptr(),
                prev_stored.size,
                prev_stored.ptr
            );
            warn_line!("FREE    (CHK ) Element has invalid metadata {:p}", ptr);
            warn_line!("FREE    (CHK ) chunkStore.ptr={:p} single={:p}", stored.ptr, ptr);
            warn_line!(
                "FREE    (CHK ) chunkStore.size={:#x} chunkList.size={:#x}",
                stored.size,
                meta.size
            );
            warn_line!("free({:p}) failed", ptr);
            raise_sigill();
        }

        if !store.remove(meta) {
            warn_line!("The pointer ({:p}) was not found in the metadata store", ptr);
            warn_line!("free({:p}) failed", ptr);
            raise_sigill();
        }
    }

    // ------------------------------------------------------------------
    // Intercepted operations
    // ------------------------------------------------------------------

    /// # Safety
    /// Single caller at a time (the API wrapper holds the facade lock).
    pub unsafe fn malloc(&mut self, len: usize) -> *mut u8 {
        info_line!("MALLOC  (PRE ) Len: {:#x}", len);
        self.pre_checks();
        let ret = hook::malloc_recursive_checked(len);
        info_line!("MALLOC  (POST) Len: {:#x} Ret: {:p}", len, ret);
        // Recording the pointer can allocate inside the store and thereby
        // move tcache/bin state; snapshots must come after it. A null
        // result bypasses recording but still refreshes the snapshots --
        // even a failed call can consolidate bins.
        if !ret.is_null() {
            self.store_pointer(ret);
        }
        self.post_snapshots();
        ret
    }

    /// # Safety
    /// Single caller at a time (the API wrapper holds the facade lock).
    pub unsafe fn calloc(&mut self, cnt: usize, len: usize) -> *mut u8 {
        info_line!("CALLOC  (PRE ) Cnt: {:#x} Len: {:#x}", cnt, len);
        self.pre_checks();
        let ret = hook::calloc_recursive_checked(cnt, len);
        if !ret.is_null() {
            self.store_pointer(ret);
        }
        self.post_snapshots();
        ret
    }

    /// # Safety
    /// `ptr` must be a non-null pointer obtained from the intercepted API.
    /// Single caller at a time.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        info_line!("FREE    (PRE ) Ptr: {:p}", ptr);
        self.pre_checks();
        self.check_pointer_before_free(ptr);
        hook::raw_free(ptr);
        self.post_snapshots();
    }

    /// Realloc as malloc-copy-free. The raw realloc may return the very
    /// same chunk, which a one-entry-per-pointer shadow cannot represent;
    /// the decomposed form guarantees a fresh pointer per call.
    ///
    /// # Safety
    /// `ptr` must be non-null and `len` non-zero (the API wrapper has
    /// already delegated the degenerate forms). Single caller at a time.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, len: usize) -> *mut u8 {
        info_line!("REALLOC (PRE ) Ptr: {:p} Len: {:#x}", ptr, len);
        self.pre_checks();

        let ret = hook::raw_malloc(len);
        if ret.is_null() {
            // The old block stays live and untouched on failure.
            self.post_snapshots();
            return ret;
        }
        self.store_pointer(ret);

        let old_header = ChunkHeader::from_user_ptr(ptr);
        let copy = old_header.usable_size().min(len);
        core::ptr::copy_nonoverlapping(ptr, ret, copy);

        self.check_pointer_before_free(ptr);
        hook::raw_free(ptr);

        self.post_snapshots();
        ret
    }
}
