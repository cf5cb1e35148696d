#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowheap::chunk::ChunkMeta;
use shadowheap::store::{CachedStore, MetaStore};
use std::collections::HashMap;

/// Fuzz the default (cached) store against a model map.
///
/// Each operation is encoded as 4 bytes:
///   byte 0: opcode (0=put, 1=get, 2=remove, 3=update, 4=clear)
///   byte 1: key slot (scaled to a fake pointer; 0 stays null)
///   byte 2-3: size word (little-endian u16)
///
/// The store must agree with the model on every observable result.
fuzz_target!(|data: &[u8]| {
    let mut store: CachedStore = CachedStore::default();
    let mut model: HashMap<usize, usize> = HashMap::new();

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 5;
        let key = (data[i + 1] as usize) * 0x10;
        let size = u16::from_le_bytes([data[i + 2], data[i + 3]]) as usize;
        i += 4;

        let ptr = key as *mut u8;
        match opcode {
            0 => {
                let expect = key != 0 && !model.contains_key(&key);
                assert_eq!(store.put(ChunkMeta::new(ptr, size)), expect);
                if expect {
                    model.insert(key, size);
                }
            }
            1 => {
                let got = store.get(ptr);
                match model.get(&key) {
                    Some(&sz) => {
                        assert_eq!(got.ptr, ptr);
                        assert_eq!(got.size, sz);
                    }
                    None => assert_eq!(got, ChunkMeta::EMPTY),
                }
            }
            2 => {
                let candidate = ChunkMeta::new(ptr, size);
                let expect = match model.get(&key) {
                    Some(&sz) => ChunkMeta::new(ptr, sz).eq_ptr_size(candidate),
                    None => false,
                };
                assert_eq!(store.remove(candidate), expect);
                if expect {
                    model.remove(&key);
                }
            }
            3 => {
                let expect = model.contains_key(&key);
                assert_eq!(store.update(ChunkMeta::new(ptr, size)), expect);
                if expect {
                    model.insert(key, size);
                }
            }
            4 => {
                store.clear();
                model.clear();
            }
            _ => unreachable!(),
        }
        assert_eq!(store.len(), model.len());
    }
});
