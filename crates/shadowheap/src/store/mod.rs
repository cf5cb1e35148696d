//! Shadow metadata store: maps a live user pointer to the chunk header it
//! had when the allocator handed it out.
//!
//! Four interchangeable back-ends share one contract; the two-layer cached
//! store is the default in the facade. Every back-end allocates its own
//! internals through [`raw_alloc::HookAllocator`], which goes straight to
//! the underlying allocator -- going through the public API would recurse
//! into the facade and would put the store's own pointers into the shadow.

mod cached;
mod hashed;
mod linear;
mod ordered;
mod raw_alloc;

pub use cached::CachedStore;
pub use hashed::HashedStore;
pub use linear::LinearStore;
pub use ordered::OrderedStore;
pub use raw_alloc::HookAllocator;

use crate::chunk::ChunkMeta;

/// The store contract shared by all back-ends.
pub trait MetaStore {
    /// Insert metadata for a chunk. Fails for null pointers and when a live
    /// entry already exists at that key.
    fn put(&mut self, chunk: ChunkMeta) -> bool;

    /// Metadata at `key`, or [`ChunkMeta::EMPTY`] if none is stored.
    fn get(&self, key: *mut u8) -> ChunkMeta;

    /// Delete the entry at `key.ptr` if it is ptr-size-equal to `key`
    /// (flag bits ignored). Returns whether an entry was deleted.
    fn remove(&mut self, key: ChunkMeta) -> bool;

    /// Replace the stored size word at `key.ptr`; false if no entry exists.
    fn update(&mut self, key: ChunkMeta) -> bool {
        let old = self.get(key.ptr);
        old.is_some() && self.remove(old) && self.put(key)
    }

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity hint to avoid internal allocations later. May be a no-op.
    fn reserve(&mut self, _capacity: usize) {}

    /// Drop all entries.
    fn clear(&mut self);
}

/// Shared test battery run against every back-end; mirrors the facade's
/// usage pattern. Lives here so the back-end modules and the integration
/// tests exercise identical expectations.
#[cfg(test)]
pub(crate) fn exercise_store_contract<S: MetaStore>(store: &mut S) {
    use crate::chunk::PREV_INUSE;

    let key1 = 0x1234 as *mut u8;
    let key2 = 0x4321 as *mut u8;
    let chunk1 = ChunkMeta::new(key1, 0x20);
    let chunk2 = ChunkMeta::new(key2, 0x130);

    assert_eq!(store.len(), 0);
    assert!(store.put(chunk1), "put(chunk1)");
    assert!(store.put(chunk2), "put(chunk2)");
    assert!(!store.put(chunk1), "duplicate put must fail");
    assert!(!store.put(ChunkMeta::new(core::ptr::null_mut(), 8)), "null put must fail");
    assert_eq!(store.get(key1), chunk1);
    assert_eq!(store.get(key2), chunk2);
    assert_eq!(store.get(0x171819 as *mut u8), ChunkMeta::EMPTY, "get(garbage)");
    assert_eq!(store.len(), 2);

    assert!(!store.remove(ChunkMeta::new(core::ptr::null_mut(), 0)), "remove(null)");
    assert!(!store.update(ChunkMeta::new(core::ptr::null_mut(), 8)), "update(null)");
    assert!(!store.update(ChunkMeta::new(0x666 as *mut u8, 0x1230)), "update(garbage)");
    assert!(store.update(ChunkMeta::new(key2, 0x140)), "update(chunk2)");
    assert_eq!(store.get(key2).size, 0x140);

    assert!(!store.remove(ChunkMeta::new(key1, 0x1230)), "remove(manipulated) must fail");
    assert!(!store.remove(ChunkMeta::new(key2, 0x130)), "remove(stale) must fail");
    assert!(!store.remove(ChunkMeta::new(0x443399 as *mut u8, 0x20)), "remove(nonexistent)");
    assert_eq!(store.len(), 2, "failed removes must not delete");

    // Flag bits must not affect removal.
    assert!(store.remove(ChunkMeta::new(key1, 0x20 | PREV_INUSE)), "flag-insensitive remove");
    assert!(store.remove(ChunkMeta::new(key2, 0x140)), "remove(updated chunk2)");
    assert_eq!(store.len(), 0);
    assert_eq!(store.get(key1), ChunkMeta::EMPTY);

    // clear() wipes whatever is left.
    assert!(store.put(chunk1));
    store.clear();
    assert_eq!(store.len(), 0);
    assert_eq!(store.get(key1), ChunkMeta::EMPTY);
}
