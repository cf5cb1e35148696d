//! Contract tests for the metadata store back-ends through the public API.
//!
//! Every back-end must satisfy the same round-trip, update, and removal
//! semantics; the cached store additionally has rehash and eviction
//! behaviour worth pinning down.

use shadowheap::chunk::{ChunkMeta, PREV_INUSE};
use shadowheap::store::{CachedStore, HashedStore, HookAllocator, LinearStore, MetaStore, OrderedStore};

/// The shared contract battery, ported across all four back-ends.
fn check_contract<S: MetaStore>(store: &mut S) {
    let key1 = 0x1234 as *mut u8;
    let key2 = 0x4321 as *mut u8;
    let chunk1 = ChunkMeta::new(key1, 0x20);
    let chunk2 = ChunkMeta::new(key2, 0x130);

    assert_eq!(store.len(), 0, "size() == 0");
    assert!(store.put(chunk1), "put(chunk1)");
    assert!(store.put(chunk2), "put(chunk2)");
    assert_eq!(store.get(key1), chunk1, "get(key1)");
    assert_eq!(store.get(key2), chunk2, "get(key2)");
    assert_eq!(store.get(0x171819 as *mut u8), ChunkMeta::EMPTY, "get(garbage) fails");
    assert_eq!(store.len(), 2, "size() == 2");

    assert!(!store.update(ChunkMeta::new(0x666 as *mut u8, 0x1230)), "update(garbage) fails");
    assert!(store.update(ChunkMeta::new(key2, 0x140)), "update(chunk2)");

    assert!(!store.remove(ChunkMeta::new(key1, 0x1230)), "remove(manipulated chunk1) fails");
    assert!(!store.remove(ChunkMeta::new(key2, 0x130)), "remove(old chunk2) fails");
    assert!(!store.remove(ChunkMeta::new(0x443399 as *mut u8, 0x20)), "remove(nonexistent) fails");
    assert!(store.remove(ChunkMeta::new(key1, 0x20)), "remove(chunk1) works");
    assert!(store.remove(ChunkMeta::new(key2, 0x140)), "remove(updated chunk2) works");
    assert_eq!(store.len(), 0, "size() == 0 at the end");
}

#[test]
fn linear_store_contract() {
    check_contract(&mut LinearStore::default());
}

#[test]
fn ordered_store_contract() {
    check_contract(&mut OrderedStore::default());
}

#[test]
fn hashed_store_contract() {
    check_contract(&mut HashedStore::default());
}

#[test]
fn cached_store_contract() {
    check_contract(&mut CachedStore::default());
}

#[test]
fn cached_store_nests_inside_itself() {
    // The cached store is a member of its own contract, so it can serve as
    // the fallback of another cached store.
    let inner: CachedStore = CachedStore::default();
    let mut nested = CachedStore::with_capacity_in(128, inner, HookAllocator);
    check_contract(&mut nested);
}

// ---------------------------------------------------------------------------
// Flag-insensitive removal
// ---------------------------------------------------------------------------

#[test]
fn remove_ignores_flag_bits_on_every_backend() {
    fn check<S: MetaStore>(store: &mut S) {
        let key = 0x7000 as *mut u8;
        assert!(store.put(ChunkMeta::new(key, 0x90 | PREV_INUSE)));
        // Same logical size, different flags: must remove.
        assert!(store.remove(ChunkMeta::new(key, 0x90)));
        // Different logical size: must not.
        assert!(store.put(ChunkMeta::new(key, 0x90)));
        assert!(!store.remove(ChunkMeta::new(key, 0xa0)));
        assert_eq!(store.len(), 1);
    }
    check(&mut LinearStore::default());
    check(&mut OrderedStore::default());
    check(&mut HashedStore::default());
    check(&mut CachedStore::default());
}

// ---------------------------------------------------------------------------
// Cached store: reserve, rehash, eviction
// ---------------------------------------------------------------------------

fn example_chunk(i: usize) -> ChunkMeta {
    ChunkMeta::new((0x20 + 8 * i) as *mut u8, 0x68 + (i << 4))
}

#[test]
fn cached_store_reserves_storage_up_front() {
    let mut store: CachedStore = CachedStore::default();
    let chunk1 = ChunkMeta::new(0x1234 as *mut u8, 0x530);
    let chunk2 = ChunkMeta::new((43234usize << 3) as *mut u8, 0x24a0);
    assert!(store.put(chunk1));
    assert!(store.put(chunk2));

    assert_eq!(store.len(), 2, "size() == 2");
    assert_eq!(store.capacity(), 128, "capacity() == 128");

    store.reserve(129); // should cause a rehash to 256

    assert_eq!(store.len(), 2, "size() == 2 after rehash");
    assert!(store.remove(chunk1), "remove(chunk1)");
    assert!(store.remove(chunk2), "remove(chunk2)");
    assert_eq!(store.len(), 0, "size() == 0");
    assert_eq!(store.capacity(), 256, "capacity() == 256");
}

#[test]
fn cached_store_rehashes_when_space_is_limited() {
    let mut store: CachedStore = CachedStore::default();
    assert_eq!(store.capacity(), 128, "initial capacity is 128");

    for i in 0..129 {
        assert!(store.put(example_chunk(i)), "insertion {} failed", i);
        assert_eq!(store.len(), i + 1, "insertion {} out of sync", i);
    }
    assert_eq!(store.len(), 129, "added 129 elements");
    assert_eq!(store.capacity(), 256, "that many elements caused a rehash");

    for i in 0..129 {
        let expected = example_chunk(i);
        assert_eq!(store.get(expected.ptr), expected, "retrieving stored chunk {}", i);
    }

    for i in 0..129 {
        assert!(store.remove(example_chunk(i)), "removing stored chunk {}", i);
    }
    assert_eq!(store.len(), 0, "no elements remain");
    assert_eq!(store.capacity(), 256, "cache capacity is unchanged");
}

#[test]
fn cached_store_eviction_keeps_all_entries_reachable() {
    // More colliding entries than a bin can hold spill into the fallback;
    // nothing may be lost and the size must track puts minus removes.
    let mut store = CachedStore::with_capacity_in(128, LinearStore::default(), HookAllocator);
    let total = 600usize;
    for i in 0..total {
        assert!(store.put(example_chunk(i)));
    }
    assert_eq!(store.len(), total);
    for i in 0..total {
        let expected = example_chunk(i);
        assert_eq!(store.get(expected.ptr), expected, "entry {} lost after eviction", i);
    }
    let mut removed = 0;
    for i in (0..total).step_by(2) {
        assert!(store.remove(example_chunk(i)));
        removed += 1;
    }
    assert_eq!(store.len(), total - removed);
}
