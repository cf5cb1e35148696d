//! Arena discovery.
//!
//! Everything here runs once, during init, from user space only: the address
//! of the main arena (and, when possible, the thread cache) is derived from
//! observable allocation behaviour, never from symbols of the underlying
//! allocator. All allocation goes through the raw hook table; the shadow
//! machinery is not live yet.

pub mod arena;
pub mod version;

pub use arena::{tcache_entry_next, ArenaView, TcacheView};
pub use version::{LibcInfo, TcacheHint};

use crate::chunk::{load_word, ChunkHeader};
#[allow(unused_imports)]
use crate::diag::info_line;
use crate::hook;
use crate::util::{
    PROBE_SIZE_BARRIER, PROBE_SIZE_LEAK, PROBE_SIZE_TCACHE, TCA_BIN_SIZE, USB_ENTRIES_MAX, WORD,
};
use core::ptr;

/// The probe's findings; `valid == false` means degraded mode (only checks
/// that need no arena keep running).
#[derive(Clone, Copy)]
pub struct ArenaInfo {
    pub valid: bool,
    pub arena: ArenaView,
    /// Base of the thread cache structure; null when absent or unleakable.
    pub tcache_base: *mut u8,
    pub libc: LibcInfo,
}

impl ArenaInfo {
    pub const INVALID: ArenaInfo = ArenaInfo {
        valid: false,
        arena: ArenaView::NULL,
        tcache_base: ptr::null_mut(),
        libc: LibcInfo::INVALID,
    };

    pub fn tcache(&self) -> TcacheView {
        TcacheView::new(self.tcache_base, self.libc.wide_tcache_counts())
    }
}

/// LIFO signature: the second allocation round must return the first
/// round's pointers in reverse order.
fn came_back_reversed(first: &[*mut u8; TCA_BIN_SIZE], second: &[*mut u8; TCA_BIN_SIZE]) -> bool {
    (0..TCA_BIN_SIZE).all(|i| first[i] == second[TCA_BIN_SIZE - 1 - i])
}

/// Detect a functional thread cache by behaviour.
///
/// Fill one bin with seven frees, force a consolidation barrier, allocate
/// seven more: with a tcache the pointers come back LIFO-reversed. On
/// success the word following the first freed entry's link is returned --
/// on allocators that key their tcache entries it is the address of the
/// tcache structure itself; otherwise it is reported as a plain "present"
/// marker.
///
/// # Safety
/// Must run during single-threaded init.
pub unsafe fn probe_tcache() -> Option<usize> {
    let mut barrier = [ptr::null_mut(); TCA_BIN_SIZE];
    let mut first = [ptr::null_mut(); TCA_BIN_SIZE];
    let mut second = [ptr::null_mut(); TCA_BIN_SIZE];

    // Drain any pre-existing cached objects of this size class.
    for slot in barrier.iter_mut() {
        *slot = hook::raw_malloc(PROBE_SIZE_TCACHE);
    }

    for slot in first.iter_mut() {
        *slot = hook::raw_malloc(PROBE_SIZE_TCACHE);
    }
    // Null the words that might hold a stale entry key.
    ptr::write_bytes(first[0], 0, 2 * WORD);
    for &slot in first.iter() {
        hook::raw_free(slot);
    }

    // After the free, the second word of a keyed tcache entry points back
    // at the tcache structure. On older allocators it is meaningless but
    // readable memory.
    let key_word = load_word(first[0], WORD);

    // A request no free list can satisfy forces consolidation.
    let barrier2 = hook::raw_malloc(PROBE_SIZE_BARRIER);

    for slot in second.iter_mut() {
        *slot = hook::raw_malloc(PROBE_SIZE_TCACHE);
    }
    for &slot in second.iter() {
        hook::raw_free(slot);
    }

    for &slot in barrier.iter() {
        hook::raw_free(slot);
    }
    hook::raw_free(barrier2);

    if !came_back_reversed(&first, &second) {
        return None;
    }
    // Never report a present tcache as zero.
    Some(if key_word == 0 { 1 } else { key_word })
}

/// Leak the main-arena base address.
///
/// A small chunk `a` is sandwiched between in-use guards so consolidation
/// cannot absorb it; the tcache (if any) is filled first so freeing `a`
/// cannot route into it. A barrier allocation then forces `a` to be sorted
/// into the first small bin, at which point `a.fd` points at the bin
/// sentinel inside the arena and the arena base is one constant away.
///
/// # Safety
/// Must run during single-threaded init with a valid version record.
pub unsafe fn leak_arena(libc: &LibcInfo) -> *mut u8 {
    if !libc.valid {
        return ptr::null_mut();
    }

    let barrier0 = hook::raw_malloc(PROBE_SIZE_BARRIER);

    let guard1 = hook::raw_malloc(PROBE_SIZE_LEAK);
    let a = hook::raw_malloc(PROBE_SIZE_LEAK);
    let guard2 = hook::raw_malloc(PROBE_SIZE_LEAK);

    if libc.tcache != TcacheHint::Absent {
        let mut fillers = [ptr::null_mut(); TCA_BIN_SIZE];
        for slot in fillers.iter_mut() {
            *slot = hook::raw_malloc(PROBE_SIZE_LEAK);
        }
        for &slot in fillers.iter() {
            hook::raw_free(slot);
        }
    }

    let header = ChunkHeader::from_user_ptr(a);
    hook::raw_free(a);

    // Unsatisfiable from the free chunks: sorts `a` into smallbin[0].
    let barrier3 = hook::raw_malloc(PROBE_SIZE_BARRIER);

    // a.fd now points at the small-bin sentinel inside the arena.
    let sentinel = header.fd();
    let arena = sentinel.wrapping_sub(libc.offset_sb0_to_main_arena);

    hook::raw_free(guard1);
    hook::raw_free(guard2);
    hook::raw_free(barrier3);
    hook::raw_free(barrier0);

    arena
}

/// Read the tcache address out of a patched allocator via its out-of-band
/// mallopt parameters, two 32-bit halves at a time. A stock allocator
/// rejects the parameters and the result stays null.
#[cfg(feature = "leak-checks")]
unsafe fn side_channel_tcache() -> *mut u8 {
    let lower = libc::mallopt(-11, 0) as u32;
    let upper = libc::mallopt(-12, 0) as u32;
    if lower == 1 || upper == 1 {
        return ptr::null_mut();
    }
    let addr = ((upper as usize) << 32) | lower as usize;
    if addr > 1 {
        addr as *mut u8
    } else {
        ptr::null_mut()
    }
}

/// Validate a leaked arena base: a single-arena process has `next` pointing
/// back at the arena itself. One known variant places the base 0x20 lower;
/// re-check against `next_free` before giving up.
unsafe fn validate_arena(view: ArenaView) -> Option<ArenaView> {
    if view.base().is_null() {
        return None;
    }
    if view.next_arena() == view.base() {
        return Some(view);
    }
    let shifted = view.rebase_down(0x20);
    if shifted.next_free_arena() == shifted.base() {
        return Some(shifted);
    }
    None
}

/// Absorb the free-list debris the probe leaves behind so it never shows up
/// in later snapshots. The pointers are deliberately leaked.
///
/// # Safety
/// Must run during single-threaded init.
pub unsafe fn clean_heap() {
    let _ = hook::raw_malloc(0x1054);
    let _ = hook::raw_malloc(0x50);
    let _ = hook::raw_malloc(0x310);
    for _ in 0..TCA_BIN_SIZE {
        let _ = hook::raw_malloc(0x10);
    }
    for _ in 0..TCA_BIN_SIZE {
        let _ = hook::raw_malloc(0x100);
    }
    let _ = hook::raw_malloc(0x400);
}

/// Run the whole discovery sequence. Fails closed: on any failure the
/// returned record is invalid and the arena-dependent checks stay off.
///
/// # Safety
/// Must run during single-threaded init.
pub unsafe fn discover(leak_mode: bool) -> ArenaInfo {
    let libc = read_libc_info();
    if !libc.valid {
        let mut info = ArenaInfo::INVALID;
        info.libc = libc;
        return info;
    }

    let base = leak_arena(&libc);
    let candidate = ArenaView::new(base, libc.offset_adjust_references);
    let arena = match validate_arena(candidate) {
        Some(view) => view,
        None => {
            let mut info = ArenaInfo::INVALID;
            info.libc = libc;
            clean_heap();
            return info;
        }
    };

    let tcache_base = match libc.tcache {
        TcacheHint::PresentAt(ptr) => ptr,
        TcacheHint::Present => {
            #[cfg(feature = "leak-checks")]
            {
                if leak_mode {
                    side_channel_tcache()
                } else {
                    ptr::null_mut()
                }
            }
            #[cfg(not(feature = "leak-checks"))]
            {
                let _ = leak_mode;
                ptr::null_mut()
            }
        }
        TcacheHint::Absent => ptr::null_mut(),
    };

    clean_heap();

    ArenaInfo { valid: true, arena, tcache_base, libc }
}

/// Version detection plus the behavioural tcache probe.
///
/// # Safety
/// Must run during single-threaded init.
pub unsafe fn read_libc_info() -> LibcInfo {
    let raw = version::running_version();
    let mut info = LibcInfo::INVALID;
    let n = raw.len().min(version::VERSION_LEN);
    info.raw_version[..n].copy_from_slice(&raw[..n]);
    info.raw_len = n;

    let Some((major, minor)) = version::parse_version(raw) else {
        return info;
    };
    info.major = major;
    info.minor = minor;

    let Some(params) = version::version_params(major, minor) else {
        return info;
    };
    info.offset_adjust_references = params.offset_adjust_references;
    info.offset_sb0_to_main_arena = version::offset_sb0(params.offset_adjust_references);

    info.tcache = if params.probe_tcache {
        match probe_tcache() {
            None => TcacheHint::Absent,
            Some(key) if params.key_is_tcache_ptr && key > 1 => {
                TcacheHint::PresentAt(key as *mut u8)
            }
            Some(_) => TcacheHint::Present,
        }
    } else {
        TcacheHint::Absent
    };

    info.valid = true;
    info
}

/// Dump the probe's findings and walk the interesting bins. Compiled out
/// unless `verbose-log` is on.
///
/// # Safety
/// `info` must describe a live arena when valid.
#[allow(unused_variables)]
pub unsafe fn log_arena_info(info: &ArenaInfo) {
    #[cfg(feature = "verbose-log")]
    {
        if !info.valid {
            info_line!("shadowheap: arena probe invalid (libc {})", info.libc.version_str());
            return;
        }
        info_line!("### leaked main_arena ############");
        info_line!("version    : {}", info.libc.version_str());
        info_line!("offset sb0 : {:#x}", info.libc.offset_sb0_to_main_arena);
        info_line!("offset ref : {:#x}", info.libc.offset_adjust_references);
        info_line!("arena      : {:p}", info.arena.base());
        info_line!("top        : {:p}", info.arena.top_chunk());
        info_line!("unsorted   : {:p}", info.arena.unsorted_head());
        info_line!("tcache     : {:p}", info.tcache_base);
        info_line!("unsrtd len : {}", count_unsorted(&info.arena));
        let tcache = info.tcache();
        if !tcache.is_null() {
            for i in 0..crate::util::TCACHE_ENTRIES {
                let count = tcache.count(i);
                if count > 0 && !tcache.entry_head(i).is_null() {
                    info_line!("tcache bin {:2}: {} entries", i, count);
                }
            }
        }
        info_line!("##################################");
    }
}

/// Length of the unsorted-bin ring, capped at the snapshot capacity.
///
/// # Safety
/// The view must point at a live arena.
#[cfg_attr(not(feature = "verbose-log"), allow(dead_code))]
unsafe fn count_unsorted(arena: &ArenaView) -> usize {
    let start = arena.unsorted_head();
    let mut node = start;
    let mut count = 0;
    loop {
        count += 1;
        let fd = ChunkHeader::from_base(node).fd();
        if fd == start || count >= USB_ENTRIES_MAX {
            return count;
        }
        node = fd;
    }
}
