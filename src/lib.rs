#![no_std]

//! A hybrid heap allocator.
//!
//! Allocation is served three ways, in the manner of a classic C allocator
//! but with all metadata visible and inspectable:
//!
//! 1. **Static arena.** The heap begins life as a 4 KiB array in `.bss`.
//!    Blocks are carved from it at a watermark and recycled through six
//!    segregated free lists after release, with splitting and coalescing to
//!    keep fragmentation in check.
//! 2. **Program-break growth.** When the arena runs dry, the data segment
//!    is extended with `sbrk`. The extension usually is not adjacent to the
//!    arena; the span of foreign bytes in between is tracked as a *gap*
//!    that every physical traversal skips.
//! 3. **Direct mmap.** Requests of 128 KiB and up get their own anonymous
//!    mapping, independent of the heap, and are returned to the kernel
//!    whole on release.
//!
//! ## Layout of the crate
//!
//! [`block`] defines the header/footer word format shared by every path;
//! [`freelist`] the segregated table; [`heap`] the engine (regions, gap,
//! split/coalesce/growth) behind the [`heap::HeapGrower`] seam;
//! [`mmap`] the large-block collaborator; and [`allocators`] the front
//! ends, from the bare [`RawAlloc`] up to [`UnixAllocator`], which can
//! serve as `#[global_allocator]` for programs whose allocations stay at
//! word alignment.
//!
//! The engine itself is single-threaded by design; [`UnixAllocator`] simply
//! serializes every entry with a spin lock. Since the program break is a
//! process-wide resource, run exactly one sbrk-backed allocator per process
//! and keep other break-movers away from it.

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod block;
pub mod freelist;
pub mod heap;
pub mod mmap;
mod unix;

pub use allocators::{GenericAllocator, RawAlloc, SbrkHeapGrower, ToyHeap, UnixAllocator};
pub use heap::{Heap, HeapGrower, Stats, Validity};
pub use mmap::MapStats;

/// Size of the static arena the heap starts from. Build-time configurable.
pub const INITIAL_HEAP_SIZE: usize = 4 * 1024;

/// Requests whose word-aligned payload reaches this size bypass the heap
/// and get a private mapping of their own. Build-time configurable.
pub const MMAP_THRESHOLD: usize = 128 * 1024;
