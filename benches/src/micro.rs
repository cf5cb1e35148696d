//! Microbenchmarks for the shadow-heap interceptor.
//!
//! The interesting number is the per-call overhead of the check/snapshot
//! brackets, so the binary talks to the C allocator symbols directly and is
//! run twice: bare, and with `LD_PRELOAD=libshadowheap.so`. Compare the
//! printed latencies.

use std::hint::black_box;
use std::time::Instant;

extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
    fn calloc(nmemb: usize, size: usize) -> *mut u8;
    fn realloc(ptr: *mut u8, size: usize) -> *mut u8;
}

fn label() -> String {
    std::env::var("ALLOCATOR_NAME").unwrap_or_else(|_| "baseline".to_string())
}

/// Mean malloc/free latency in nanoseconds for one request size.
fn bench_malloc_free(size: usize, iterations: usize) -> f64 {
    for _ in 0..1000 {
        unsafe {
            let ptr = malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, size.min(64));
            free(black_box(ptr));
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, size.min(64));
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

fn bench_calloc_free(size: usize, iterations: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = calloc(black_box(1), black_box(size));
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Growing realloc chain; with the shadow active every step is a full
/// malloc-copy-free.
fn bench_realloc_grow(iterations: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let mut ptr = malloc(black_box(16));
            for &size in black_box(&[32usize, 64, 128, 256, 512, 1024]) {
                ptr = realloc(black_box(ptr), size);
            }
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Many live allocations: stresses the metadata store's cache layer and
/// its fallback eviction path.
fn bench_live_set(count: usize, size: usize) -> f64 {
    let start = Instant::now();
    let mut ptrs = Vec::with_capacity(count);
    unsafe {
        for _ in 0..count {
            ptrs.push(malloc(black_box(size)));
        }
        for &ptr in ptrs.iter().rev() {
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / (2 * count) as f64
}

fn main() {
    let iterations = 200_000;
    println!("allocator: {}", label());
    for &size in &[16usize, 64, 256, 1024, 4096, 16384] {
        println!(
            "malloc/free  {:>6}B: {:>9.1} ns/op",
            size,
            bench_malloc_free(size, iterations)
        );
    }
    println!("calloc/free    256B: {:>9.1} ns/op", bench_calloc_free(256, iterations));
    println!("realloc chain      : {:>9.1} ns/chain", bench_realloc_grow(iterations / 10));
    println!("live set 100k x 64B: {:>9.1} ns/op", bench_live_set(100_000, 64));
}
