//! Unordered associative back-end: a hash map keyed by pointer.
//!
//! Only the raw size word is stored as the value; the key is the pointer
//! itself, so an entry reconstructs to a full [`ChunkMeta`] on the way out.

use super::{HookAllocator, MetaStore};
use crate::chunk::ChunkMeta;
use crate::util::splitmix64;
use allocator_api2::alloc::Allocator;
use core::hash::{BuildHasherDefault, Hasher};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// Pointer keys are already unique machine words; one splitmix64 round gives
/// the high-entropy upper bits hashbrown's control bytes want.
#[derive(Default)]
pub struct PtrHasher(u64);

impl Hasher for PtrHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        // Only reached for non-usize keys; fold bytes into the state.
        for &b in bytes {
            self.0 = splitmix64(self.0 ^ b as u64);
        }
    }

    fn write_usize(&mut self, i: usize) {
        self.0 = splitmix64(i as u64);
    }

    fn write_u64(&mut self, i: u64) {
        self.0 = splitmix64(i);
    }
}

type BuildPtrHasher = BuildHasherDefault<PtrHasher>;

pub struct HashedStore<A: Allocator + Clone = HookAllocator> {
    elements: HashMap<usize, usize, BuildPtrHasher, A>,
}

impl Default for HashedStore<HookAllocator> {
    fn default() -> Self {
        HashedStore::new_in(HookAllocator)
    }
}

impl<A: Allocator + Clone> HashedStore<A> {
    pub fn new_in(alloc: A) -> Self {
        HashedStore { elements: HashMap::with_hasher_in(BuildPtrHasher::default(), alloc) }
    }
}

impl<A: Allocator + Clone> MetaStore for HashedStore<A> {
    fn put(&mut self, chunk: ChunkMeta) -> bool {
        if chunk.ptr.is_null() {
            return false;
        }
        match self.elements.entry(chunk.ptr as usize) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(chunk.size);
                true
            }
        }
    }

    fn get(&self, key: *mut u8) -> ChunkMeta {
        match self.elements.get(&(key as usize)) {
            Some(&size) => ChunkMeta::new(key, size),
            None => ChunkMeta::EMPTY,
        }
    }

    fn remove(&mut self, key: ChunkMeta) -> bool {
        match self.elements.entry(key.ptr as usize) {
            Entry::Occupied(slot) => {
                if !ChunkMeta::new(key.ptr, *slot.get()).eq_ptr_size(key) {
                    return false;
                }
                slot.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    fn update(&mut self, key: ChunkMeta) -> bool {
        match self.elements.get_mut(&(key.ptr as usize)) {
            Some(size) => {
                *size = key.size;
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.elements.len()
    }

    fn reserve(&mut self, capacity: usize) {
        let extra = capacity.saturating_sub(self.elements.len());
        self.elements.reserve(extra);
    }

    fn clear(&mut self) {
        self.elements.clear();
    }
}
