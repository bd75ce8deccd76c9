//! Allocator front ends, generic and Unix-specific.
//!
//! ## The pieces
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is the single-threaded façade over the heap engine: it
//! does the size accounting (alignment, metadata words, minimum block
//! size), routes large requests to the mmap collaborator, and exposes the
//! C-style `allocate`/`release` pair plus the `Layout`-based entry points
//! that `GlobalAlloc` needs. Not thread-safe on its own.
//!
//! ### [`SbrkHeapGrower`](struct.SbrkHeapGrower.html)
//!
//! The production grower: starts the heap in a static 4 KiB arena in `.bss`
//! and extends it by advancing the program break. Since the break is a
//! process-wide cursor, there must be at most one of these actually feeding
//! a heap, and nothing else in the process should be moving the break.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! A deterministic grower over a plain array, for tests. Its `skip_next`
//! knob displaces the next extension to force the gap path; left at zero,
//! extensions are contiguous.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html) / [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! `GenericAllocator` wraps a `RawAlloc` in a spin lock behind a one-time
//! atomic initializer so it can live in a `static`. `UnixAllocator` is that
//! wrapper fixed to the sbrk grower and implements `GlobalAlloc`.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use errno::Errno;
use spin::{Mutex, MutexGuard};

use crate::block::{align, round_up, BlockPtr, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, WORD_SIZE};
use crate::heap::{Heap, HeapGrower, Stats, Validity};
use crate::mmap::{self, MapStats};
use crate::unix;
use crate::{INITIAL_HEAP_SIZE, MMAP_THRESHOLD};

/// Backing storage for the static arena. Zero-initialized, so it lives in
/// `.bss` just like any other blank static.
#[repr(align(16))]
struct Arena([u8; INITIAL_HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; INITIAL_HEAP_SIZE]);

/// Grows the heap by advancing the program break.
#[derive(Default)]
pub struct SbrkHeapGrower {
    // Just for tracking, not really needed
    pub growths: usize,
    pub grown_bytes: usize,
}

impl HeapGrower for SbrkHeapGrower {
    type Err = Errno;

    unsafe fn initial_region(&mut self) -> (NonNull<u8>, usize) {
        (
            NonNull::new_unchecked(ptr::addr_of_mut!(ARENA).cast::<u8>()),
            INITIAL_HEAP_SIZE,
        )
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        // sbrk has page granularity; asking for less than a page would get
        // a page anyway, so round up front and account for all of it.
        let to_allocate = round_up(size.max(1), unix::page_size());
        let region = unix::sbrk(to_allocate)?;

        self.growths += 1;
        self.grown_bytes += to_allocate;

        Ok((region, to_allocate))
    }
}

/// Size of [`ToyHeap`]'s backing array.
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

#[repr(align(16))]
pub struct ToyStorage(pub [u8; TOY_HEAP_SIZE]);

/// A static array pretending to be a growable data segment, for tests.
///
/// The first [`INITIAL_HEAP_SIZE`] bytes play the static arena; the rest is
/// granted through `grow_heap` in `page_size` granules. Setting `skip_next`
/// wastes that many bytes before the next grant, which makes the grant
/// non-contiguous and forces the heap's gap handling, the same situation as
/// foreign data sitting between the arena and the moved break.
pub struct ToyHeap {
    pub page_size: usize,
    /// Current break, as an offset into `heap`.
    pub size: usize,
    /// Bytes to waste before the next grant. Must stay word-aligned.
    pub skip_next: usize,
    pub heap: ToyStorage,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            page_size: 64,
            size: 0,
            skip_next: 0,
            heap: ToyStorage([0; TOY_HEAP_SIZE]),
        }
    }
}

impl ToyHeap {
    pub fn base(&mut self) -> *mut u8 {
        self.heap.0.as_mut_ptr()
    }
}

pub struct ToyHeapOverflowError();

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn initial_region(&mut self) -> (NonNull<u8>, usize) {
        self.size = INITIAL_HEAP_SIZE;
        (
            NonNull::new_unchecked(self.heap.0.as_mut_ptr()),
            INITIAL_HEAP_SIZE,
        )
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        debug_assert!(self.skip_next % WORD_SIZE == 0);
        self.size += core::mem::take(&mut self.skip_next);

        let allocating = round_up(size, self.page_size);
        if self.size + allocating > TOY_HEAP_SIZE {
            return Err(ToyHeapOverflowError());
        }

        let region = self.heap.0.as_mut_ptr().add(self.size);
        self.size += allocating;
        Ok((NonNull::new_unchecked(region), allocating))
    }
}

/// The allocation façade: request sizing, mmap routing, and the heap engine
/// underneath.
pub struct RawAlloc<G> {
    pub heap: Heap<G>,
    pub mapped: MapStats,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    pub fn new(grower: G) -> Self {
        RawAlloc {
            heap: Heap::new(grower),
            mapped: MapStats::default(),
        }
    }

    /// Get statistics on this allocator, and verify validity of the heap.
    pub fn stats(&self) -> (Validity, Stats) {
        self.heap.stats()
    }

    /// Allocates `size` bytes and returns a word-aligned pointer to them,
    /// or null when `size` is zero or memory is exhausted.
    ///
    /// # Safety
    ///
    /// The allocator must not be moved once this has been called, and every
    /// returned pointer must be released by this same allocator.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }

        let aligned = align(size);

        // Large requests bypass the heap entirely; the mapping is its own
        // block with no footer and no list membership.
        if aligned >= MMAP_THRESHOLD {
            return mmap::map_block(aligned, &mut self.mapped);
        }

        let mut total = HEADER_SIZE + aligned + FOOTER_SIZE;
        if total < MIN_BLOCK_SIZE {
            total = MIN_BLOCK_SIZE;
        }

        match self.heap.allocate(total) {
            Some(payload) => payload.as_ptr(),
            None => null_mut(),
        }
    }

    /// Releases a pointer previously returned by [`Self::allocate`].
    /// Releasing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this allocator. Double
    /// release and foreign pointers are undefined behaviour, with no
    /// detection attempted.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            None => return,
            Some(p) => p,
        };

        let block = BlockPtr::from_payload(payload);
        if block.is_mmapped() {
            mmap::unmap_block(block, &mut self.mapped);
            return;
        }

        self.heap.free_block(block);
    }

    ////////////////////////////////////////////////////////////
    // Functions for implementing GlobalAlloc

    /// `Layout`-based entry point. The block format fixes payloads at word
    /// alignment, so stricter alignments are refused with a null return.
    ///
    /// # Safety
    ///
    /// See [`Self::allocate`].
    pub unsafe fn alloc(&mut self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD_SIZE {
            log::warn!(
                "requested alignment {} exceeds word alignment, refusing",
                layout.align()
            );
            return null_mut();
        }
        self.allocate(layout.size())
    }

    /// # Safety
    ///
    /// See [`Self::release`]. The layout is not needed; blocks are
    /// self-describing.
    pub unsafe fn dealloc(&mut self, ptr: *mut u8, _layout: Layout) {
        self.release(ptr)
    }
}

const UNTOUCHED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A `RawAlloc` behind a spin lock and a one-time atomic initializer, fit
/// for a `static`.
///
/// The two-step dance exists because a `static` needs a `const`
/// constructor, and building the heap is not `const`. The allocator state
/// starts as uninitialized memory; the first caller to arrive flips the
/// state to `INITIALIZING`, writes the real value, and publishes it as
/// `READY`. Everyone else either sees `READY` and proceeds, or spins for
/// the short window in which the winner is still writing.
pub struct GenericAllocator<G> {
    state: AtomicU8,
    raw: MaybeUninit<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            state: AtomicU8::new(UNTOUCHED),
            raw: MaybeUninit::uninit(),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Locks and returns the underlying `RawAlloc`, initializing it on the
    /// first call.
    ///
    /// # Safety
    ///
    /// Allocation from other threads blocks while the guard is held, so the
    /// caller must not allocate through this allocator while holding it.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<G>> {
        // SeqCst everywhere: this runs once per allocation, and an
        // allocator is the wrong place to be clever about orderings.
        match self
            .state
            .compare_exchange(UNTOUCHED, INITIALIZING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                // We won the race to initialize.
                let slot = self.raw.as_ptr() as *mut Mutex<RawAlloc<G>>;
                slot.write(Mutex::new(RawAlloc::default()));
                self.state.store(READY, Ordering::SeqCst);
                (*slot).lock()
            }
            Err(READY) => self.raw.assume_init_ref().lock(),
            Err(_) => {
                // Somebody else is mid-initialization; wait them out.
                while self.state.load(Ordering::SeqCst) != READY {
                    core::hint::spin_loop();
                }
                self.raw.assume_init_ref().lock()
            }
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

/// The process-wide allocator: static arena, program-break growth, mmap for
/// large blocks. Usable as `#[global_allocator]`.
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<SbrkHeapGrower>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.get_raw().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.get_raw().dealloc(ptr, layout)
    }
}
