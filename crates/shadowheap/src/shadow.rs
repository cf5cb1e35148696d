//! Shadow snapshots of allocator state.
//!
//! Fixed-capacity mirrors of the top-chunk size word, the unsorted-bin ring
//! and the tcache bins. Each mirror has a store half (run after every
//! intercepted call) and a check half (run before the next one). The check
//! halves emit their diagnostic and report failure; converting failure into
//! the fatal signal is the facade's job, which keeps the comparison logic
//! testable against fabricated arena images.

use crate::chunk::{BinNode, ChunkHeader, TcacheCell};
use crate::diag::{info_line, warn_line};
use crate::probe::{tcache_entry_next, ArenaView, TcacheView};
use crate::util::{TCACHE_ENTRIES, TCA_BIN_SIZE, USB_ENTRIES_MAX};

/// A failed consistency check; the diagnostic is already on stderr.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Corruption;

pub struct ShadowData {
    /// Last observed top-chunk size word; 0 means nothing stored yet.
    top_size: usize,
    unsorted: [BinNode; USB_ENTRIES_MAX],
    unsorted_len: usize,
    tcache: [[TcacheCell; TCA_BIN_SIZE]; TCACHE_ENTRIES],
    tcache_has_data: bool,
}

impl ShadowData {
    pub const fn new() -> Self {
        ShadowData {
            top_size: 0,
            unsorted: [BinNode::EMPTY; USB_ENTRIES_MAX],
            unsorted_len: 0,
            tcache: [[TcacheCell::EMPTY; TCA_BIN_SIZE]; TCACHE_ENTRIES],
            tcache_has_data: false,
        }
    }

    // ------------------------------------------------------------------
    // Top chunk
    // ------------------------------------------------------------------

    /// Mirror the raw size word of the current top chunk. Top only changes
    /// through allocator calls, all of which we bracket; any other change
    /// is a house-of-force-style overwrite.
    ///
    /// # Safety
    /// `arena` must describe a live arena.
    pub unsafe fn store_topchunk(&mut self, arena: &ArenaView) {
        let top = ChunkHeader::from_base(arena.top_chunk());
        self.top_size = top.size_word();
        info_line!("TOPC    (STR ) Stored topchunksize ({:#x})", self.top_size);
    }

    /// # Safety
    /// `arena` must describe a live arena.
    pub unsafe fn check_topchunk(&self, arena: &ArenaView) -> Result<(), Corruption> {
        if self.top_size == 0 {
            return Ok(());
        }
        let current = ChunkHeader::from_base(arena.top_chunk()).size_word();
        if self.top_size != current {
            warn_line!("topchunk corrupted: old={:#x} new={:#x}", self.top_size, current);
            return Err(Corruption);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unsorted bin
    // ------------------------------------------------------------------

    /// Walk the unsorted ring from the sentinel's fd and mirror every node.
    /// The ring is cyclic through the sentinel, so the walk stops when the
    /// head reappears, with a hard bound for pathological input.
    ///
    /// # Safety
    /// `arena` must describe a live arena.
    pub unsafe fn store_unsorted(&mut self, arena: &ArenaView) {
        self.unsorted_len = 0;
        let start = arena.unsorted_head();
        let mut node = start;
        loop {
            let header = ChunkHeader::from_base(node);
            self.unsorted[self.unsorted_len] = BinNode::from_header(header);
            self.unsorted_len += 1;
            info_line!(
                "USRT    (STR ) Stored unsorted_bin[{}] ({:p})",
                self.unsorted_len - 1,
                node
            );
            if header.fd() == start || self.unsorted_len >= USB_ENTRIES_MAX {
                return;
            }
            node = header.fd();
        }
    }

    /// Re-walk the ring and compare positionally; any of the four mirrored
    /// fields differing means someone rewired the list between calls.
    ///
    /// # Safety
    /// `arena` must describe a live arena.
    pub unsafe fn check_unsorted(&self, arena: &ArenaView) -> Result<(), Corruption> {
        let mut node = arena.unsorted_head();
        for i in 0..self.unsorted_len {
            let stored = self.unsorted[i];
            let actual = BinNode::from_header(ChunkHeader::from_base(node));
            if actual != stored {
                warn_line!("USRT    (CHK ) Element {} has invalid metadata {:p}", i, node);
                warn_line!(
                    "USRT    (CHK ) stored.ptr={:p}  actual.ptr={:p}",
                    stored.ptr,
                    actual.ptr
                );
                warn_line!(
                    "USRT    (CHK ) stored.size={:#x} actual.size={:#x}",
                    stored.chunk_size,
                    actual.chunk_size
                );
                warn_line!("USRT    (CHK ) unsorted_bin corrupted: ({:p}) failed", node);
                return Err(Corruption);
            }
            node = actual.fd;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Thread cache
    // ------------------------------------------------------------------

    /// Mirror every populated tcache bin, slot 0 being the LIFO head.
    ///
    /// TODO: the walk trusts the allocator's per-bin counts, which are
    /// themselves corruptible; bound the walk by non-null `next` only.
    ///
    /// # Safety
    /// `tcache` must be null or describe a live tcache.
    pub unsafe fn store_tcache(&mut self, tcache: &TcacheView) {
        if tcache.is_null() {
            return;
        }
        for i in 0..TCACHE_ENTRIES {
            let mut entry = tcache.entry_head(i);
            if entry.is_null() || tcache.count(i) == 0 {
                continue;
            }
            info_line!(
                "TCA     (STR ) {:p} ({}) => {} element(s)",
                tcache.base(),
                i,
                tcache.count(i)
            );
            for b in 0..TCA_BIN_SIZE {
                let header = ChunkHeader::from_user_ptr(entry);
                self.tcache[i][b] =
                    TcacheCell { orig_ptr: entry, size: header.chunk_size(), next: header.fd() };
                self.tcache_has_data = true;

                let next = tcache_entry_next(entry);
                if next.is_null() {
                    break;
                }
                entry = next;
            }
        }
    }

    /// Re-walk the bins against the mirrored cells. The lists are singly
    /// linked; the profitable attack is redirecting a `next` pointer, which
    /// the per-cell compare catches. A successful pass empties the
    /// snapshot so a check without an intervening store is a no-op.
    ///
    /// # Safety
    /// `tcache` must be null or describe a live tcache.
    pub unsafe fn check_tcache(&mut self, tcache: &TcacheView) -> Result<(), Corruption> {
        if !self.tcache_has_data || tcache.is_null() {
            return Ok(());
        }
        for i in 0..TCACHE_ENTRIES {
            let mut entry = tcache.entry_head(i);
            if entry.is_null() || tcache.count(i) == 0 {
                continue;
            }
            for b in 0..TCA_BIN_SIZE {
                let header = ChunkHeader::from_user_ptr(entry);
                let cell = self.tcache[i][b];

                if cell.next != header.fd() {
                    warn_line!(
                        "TCA     (CHK ) tcache_bin corrupted: ({:p}) fd-field not valid",
                        entry
                    );
                    return Err(Corruption);
                }
                if cell.orig_ptr != entry {
                    warn_line!(
                        "TCA     (CHK ) tcache_bin corrupted: ({:p}) bk-field not valid",
                        entry
                    );
                    return Err(Corruption);
                }
                if cell.size != header.chunk_size() {
                    warn_line!(
                        "TCA     (CHK ) tcache_bin corrupted: ({:p}) size-field not valid",
                        entry
                    );
                    return Err(Corruption);
                }

                let next = tcache_entry_next(entry);
                if next.is_null() {
                    break;
                }
                entry = next;
            }
        }
        self.tcache_has_data = false;
        Ok(())
    }

    #[cfg(test)]
    fn unsorted_len(&self) -> usize {
        self.unsorted_len
    }
}
