//! shadowheap: a preloaded shadow-heap integrity monitor.
//!
//! Intercepts `malloc`/`calloc`/`realloc`/`free`, delegates the real work
//! to the underlying allocator, and cross-checks the allocator's own
//! bookkeeping against an out-of-band mirror on every call. A discrepancy
//! -- an overwritten chunk header, a poisoned tcache or unsorted-bin link,
//! a grown top chunk -- kills the process with `SIGILL` before it can be
//! weaponized.
//!
//! Build as a cdylib and run with `LD_PRELOAD=libshadowheap.so <prog>`.

extern crate libc;

pub mod api;
pub mod chunk;
pub mod config;
pub mod diag;
pub mod facade;
pub mod hook;
pub mod init;
pub mod probe;
pub mod shadow;
pub mod store;
pub mod sync;
pub mod util;
