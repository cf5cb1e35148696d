//! Linear-scan back-end: a flat array of entries.
//!
//! O(n) everything, no hashing, no tree juggling. Useful as a baseline and
//! as the fallback of last resort when predictable iteration order matters
//! more than speed.

use super::{HookAllocator, MetaStore};
use crate::chunk::ChunkMeta;
use allocator_api2::alloc::Allocator;
use allocator_api2::vec::Vec;

pub struct LinearStore<A: Allocator = HookAllocator> {
    elements: Vec<ChunkMeta, A>,
}

impl Default for LinearStore<HookAllocator> {
    fn default() -> Self {
        LinearStore::new_in(HookAllocator)
    }
}

impl<A: Allocator> LinearStore<A> {
    pub fn new_in(alloc: A) -> Self {
        LinearStore { elements: Vec::new_in(alloc) }
    }

    fn position(&self, key: *mut u8) -> Option<usize> {
        self.elements.iter().position(|chunk| chunk.ptr == key)
    }
}

impl<A: Allocator> MetaStore for LinearStore<A> {
    fn put(&mut self, chunk: ChunkMeta) -> bool {
        if chunk.ptr.is_null() || self.position(chunk.ptr).is_some() {
            return false;
        }
        self.elements.push(chunk);
        true
    }

    fn get(&self, key: *mut u8) -> ChunkMeta {
        match self.position(key) {
            Some(i) => self.elements[i],
            None => ChunkMeta::EMPTY,
        }
    }

    fn remove(&mut self, key: ChunkMeta) -> bool {
        let Some(i) = self.position(key.ptr) else {
            return false;
        };
        if !self.elements[i].eq_ptr_size(key) {
            return false;
        }
        // Order is irrelevant; swap with the tail and pop.
        self.elements.swap_remove(i);
        true
    }

    fn update(&mut self, key: ChunkMeta) -> bool {
        match self.position(key.ptr) {
            Some(i) => {
                self.elements[i] = key;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_store_contract() {
        let mut store = LinearStore::default();
        crate::store::exercise_store_contract(&mut store);
    }

    #[test]
    fn reserve_prevents_reallocation_for_small_batches() {
        let mut store = LinearStore::default();
        store.reserve(64);
        for i in 1..=64usize {
            assert!(store.put(ChunkMeta::new((i * 0x20) as *mut u8, 0x20)));
        }
        assert_eq!(store.len(), 64);
    }
}
