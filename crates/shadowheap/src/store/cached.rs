//! Two-layer cached back-end (the default).
//!
//! The primary layer is a power-of-two array of 4-wide bins, each sized to
//! fit one cache line; the hot path is a single hashed probe. A bin with no
//! free cell evicts a pseudo-randomly chosen victim into a fallback store,
//! so nothing is ever lost. Growth doubles the bin array in place and
//! re-buckets: after a doubling, every entry either stays put or moves to
//! the one bin whose index differs in the newly significant bit, and that
//! target bin is guaranteed to have room.

use super::{HookAllocator, MetaStore, OrderedStore};
use crate::chunk::ChunkMeta;
use crate::util::splitmix64;
use allocator_api2::alloc::Allocator;
use allocator_api2::vec::Vec;

const ENTRIES_PER_BIN: usize = 4;
/// Bits of the hash consumed by the in-bin victim index.
const ENTRY_BITS: u32 = 2;
/// Initial capacity in entries; must stay a power of two.
const INITIAL_CAPACITY: usize = 128;

type Bin = [ChunkMeta; ENTRIES_PER_BIN];

const EMPTY_BIN: Bin = [ChunkMeta::EMPTY; ENTRIES_PER_BIN];

#[inline]
fn hash_key(key: *mut u8) -> u64 {
    splitmix64(key as usize as u64)
}

pub struct CachedStore<F: MetaStore = OrderedStore, A: Allocator + Clone = HookAllocator> {
    cache_entries: usize,
    bins: Vec<Bin, A>,
    fallback: F,
}

impl Default for CachedStore<OrderedStore, HookAllocator> {
    fn default() -> Self {
        CachedStore::with_capacity_in(INITIAL_CAPACITY, OrderedStore::default(), HookAllocator)
    }
}

impl<F: MetaStore, A: Allocator + Clone> CachedStore<F, A> {
    /// `capacity` is in entries and must be a power of two of at least one
    /// bin.
    pub fn with_capacity_in(capacity: usize, fallback: F, alloc: A) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(capacity >= ENTRIES_PER_BIN);
        let bin_count = capacity / ENTRIES_PER_BIN;
        let mut bins = Vec::new_in(alloc);
        bins.resize(bin_count, EMPTY_BIN);
        CachedStore { cache_entries: 0, bins, fallback }
    }

    /// Capacity of the caching layer, not of the entire store.
    pub fn capacity(&self) -> usize {
        self.bins.len() * ENTRIES_PER_BIN
    }

    #[inline]
    fn bin_index(&self, raw_hash: u64) -> usize {
        raw_hash as usize & (self.bins.len() - 1)
    }

    fn cache_position(&self, key: *mut u8) -> Option<(usize, usize)> {
        // A null key would match every empty cell.
        if key.is_null() {
            return None;
        }
        let bin_i = self.bin_index(hash_key(key));
        self.bins[bin_i]
            .iter()
            .position(|entry| entry.ptr == key)
            .map(|entry_i| (bin_i, entry_i))
    }

    /// Cell for inserting `key`: the first empty cell of the target bin, or
    /// a victim picked from the unused top bits of the hash when the bin is
    /// full.
    fn insertion_point(&mut self, key: *mut u8) -> &mut ChunkMeta {
        let raw_hash = hash_key(key);
        let bin_i = self.bin_index(raw_hash);
        let bin = &mut self.bins[bin_i];
        let entry_i = match bin.iter().position(|entry| entry.ptr.is_null()) {
            Some(i) => i,
            None => (raw_hash >> (64 - ENTRY_BITS)) as usize & (ENTRIES_PER_BIN - 1),
        };
        &mut bin[entry_i]
    }

    /// Grow the cache to hold at least `required` entries.
    pub fn ensure_capacity(&mut self, required: usize) {
        while self.capacity() < required {
            self.double();
        }
    }

    fn double(&mut self) {
        let old_bins = self.bins.len();
        self.bins.resize(old_bins * 2, EMPTY_BIN);
        let new_mask = self.bins.len() - 1;

        for bin_i in 0..old_bins {
            for entry_i in 0..ENTRIES_PER_BIN {
                let entry = self.bins[bin_i][entry_i];
                if entry.ptr.is_null() {
                    continue;
                }
                let new_bin_i = hash_key(entry.ptr) as usize & new_mask;
                if new_bin_i == bin_i {
                    continue;
                }
                // The only other possible home is bin_i + old_bins, which
                // started this doubling empty, so a free cell exists.
                self.bins[bin_i][entry_i] = ChunkMeta::EMPTY;
                for cell in self.bins[new_bin_i].iter_mut() {
                    if cell.ptr.is_null() {
                        *cell = entry;
                        break;
                    }
                }
            }
        }
    }
}

impl<F: MetaStore, A: Allocator + Clone> MetaStore for CachedStore<F, A> {
    fn put(&mut self, chunk: ChunkMeta) -> bool {
        // Key presence, not is_some(): a zero size word is still an entry.
        if chunk.ptr.is_null() || !self.get(chunk.ptr).ptr.is_null() {
            return false;
        }

        // Decide whether to rehash before touching the bins.
        self.ensure_capacity(self.len() + 1);

        let slot = self.insertion_point(chunk.ptr);
        let displaced = core::mem::replace(slot, chunk);
        if displaced.ptr.is_null() {
            self.cache_entries += 1;
            return true;
        }
        // The bin was full: the victim moves down into the fallback store,
        // the newcomer keeps the cache cell, so the entry count is unchanged
        // up here.
        self.fallback.put(displaced)
    }

    fn get(&self, key: *mut u8) -> ChunkMeta {
        match self.cache_position(key) {
            Some((bin_i, entry_i)) => self.bins[bin_i][entry_i],
            None => self.fallback.get(key),
        }
    }

    fn remove(&mut self, key: ChunkMeta) -> bool {
        if let Some((bin_i, entry_i)) = self.cache_position(key.ptr) {
            if !self.bins[bin_i][entry_i].eq_ptr_size(key) {
                return false;
            }
            self.bins[bin_i][entry_i] = ChunkMeta::EMPTY;
            self.cache_entries -= 1;
            return true;
        }
        self.fallback.remove(key)
    }

    fn update(&mut self, key: ChunkMeta) -> bool {
        match self.cache_position(key.ptr) {
            Some((bin_i, entry_i)) => {
                self.bins[bin_i][entry_i] = key;
                true
            }
            None => self.fallback.update(key),
        }
    }

    fn len(&self) -> usize {
        self.cache_entries + self.fallback.len()
    }

    fn reserve(&mut self, capacity: usize) {
        self.ensure_capacity(capacity);
    }

    fn clear(&mut self) {
        for bin in self.bins.iter_mut() {
            *bin = EMPTY_BIN;
        }
        self.cache_entries = 0;
        self.fallback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HashedStore, LinearStore};

    #[test]
    fn satisfies_store_contract() {
        let mut store = CachedStore::default();
        crate::store::exercise_store_contract(&mut store);
    }

    #[test]
    fn satisfies_contract_over_every_fallback() {
        let mut over_linear =
            CachedStore::with_capacity_in(128, LinearStore::default(), HookAllocator);
        crate::store::exercise_store_contract(&mut over_linear);

        let mut over_hashed =
            CachedStore::with_capacity_in(128, HashedStore::default(), HookAllocator);
        crate::store::exercise_store_contract(&mut over_hashed);

        // The cached store is itself a member of the contract, so it nests.
        let mut over_cached =
            CachedStore::with_capacity_in(128, CachedStore::default(), HookAllocator);
        crate::store::exercise_store_contract(&mut over_cached);
    }

    #[test]
    fn reserve_grows_capacity_without_losing_entries() {
        let mut store = CachedStore::default();
        let chunk1 = ChunkMeta::new(0x1234 as *mut u8, 0x50);
        let chunk2 = ChunkMeta::new((43234 << 3) as *mut u8, 0x2490);
        assert!(store.put(chunk1));
        assert!(store.put(chunk2));
        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), 128);

        store.reserve(129); // forces a rehash to 256

        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), 256);
        assert!(store.remove(chunk1));
        assert!(store.remove(chunk2));
        assert_eq!(store.len(), 0);
        assert_eq!(store.capacity(), 256);
    }

    fn example_chunk(i: usize) -> ChunkMeta {
        // Keys must be non-null and distinct.
        ChunkMeta::new((0x20 + 8 * i) as *mut u8, 0x68 + (i << 4))
    }

    #[test]
    fn rehash_preserves_every_entry() {
        let mut store = CachedStore::default();
        assert_eq!(store.capacity(), 128);

        for i in 0..129 {
            let chunk = example_chunk(i);
            assert!(store.put(chunk), "insertion {} failed", i);
            assert_eq!(store.len(), i + 1, "insertion {} out of sync", i);
        }
        assert_eq!(store.capacity(), 256, "129 entries must have doubled the cache");

        for i in 0..129 {
            let expected = example_chunk(i);
            assert_eq!(store.get(expected.ptr), expected, "entry {} lost by rehash", i);
        }

        for i in 0..129 {
            assert!(store.remove(example_chunk(i)), "removing entry {}", i);
        }
        assert_eq!(store.len(), 0);
        assert_eq!(store.capacity(), 256, "cache capacity is kept after removal");
    }

    #[test]
    fn eviction_spills_to_fallback_without_losing_entries() {
        // A small cache plus many colliding inserts forces evictions; all
        // entries must stay retrievable and the count exact.
        let mut store = CachedStore::with_capacity_in(128, LinearStore::default(), HookAllocator);
        let n = 600usize;
        for i in 0..n {
            assert!(store.put(example_chunk(i)));
        }
        assert_eq!(store.len(), n);
        for i in 0..n {
            let expected = example_chunk(i);
            assert_eq!(store.get(expected.ptr), expected, "entry {} lost", i);
        }
        for i in (0..n).step_by(3) {
            assert!(store.remove(example_chunk(i)));
        }
        assert_eq!(store.len(), n - n.div_ceil(3));
    }

    #[test]
    fn update_rewrites_size_in_cache_and_fallback() {
        let mut store = CachedStore::with_capacity_in(128, LinearStore::default(), HookAllocator);
        for i in 0..300 {
            assert!(store.put(example_chunk(i)));
        }
        for i in 0..300 {
            let mut chunk = example_chunk(i);
            chunk.size = 0x1000 + i;
            assert!(store.update(chunk), "update {} failed", i);
        }
        for i in 0..300 {
            assert_eq!(store.get(example_chunk(i).ptr).size, 0x1000 + i);
        }
    }
}
