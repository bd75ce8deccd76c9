//! The heap engine.
//!
//! [`Heap`] owns the region model and the core algorithms. The live address
//! space is the static arena handed over by the grower, plus any
//! program-break extensions obtained later:
//!
//! ```text
//!   start                      top            end
//!     |                         |              |
//!     v                         v              v
//!     +----------+----------+---+--------------+
//!     | block    | block    |...|    slack     |
//!     +----------+----------+---+--------------+
//! ```
//!
//! `start` never moves, `top` is the carving watermark, and `end` is one
//! past the last byte the process owns. Growth may land the new region right
//! at `end` (contiguous) or further up, in which case the span in between
//! belongs to somebody else and is recorded as the *gap*. Every physical
//! traversal, and in particular the neighbor probes in coalescing, must skip
//! the gap: the bytes in there look like anything at all, and interpreting
//! one of them as a footer would send `prev_physical` into the weeds.
//!
//! The engine is deliberately single-threaded; serialization for
//! `GlobalAlloc` use is layered on top in [`crate::allocators`].

use core::fmt;
use core::ptr::{self, NonNull};

use crate::block::{align, BlockPtr, FOOTER_SIZE, MIN_BLOCK_SIZE, SIZE_MASK, WORD_SIZE};
use crate::freelist::FreeTable;

/// Source of heap memory.
///
/// A grower provides the initial region the heap starts from and extends it
/// on demand, in the manner of the program-break syscall: each extension
/// returns the first address of the fresh region and the number of bytes
/// actually granted, which is at least the number requested and a multiple
/// of the grower's page size. Whether an extension is contiguous with the
/// previous region is the grower's business; the heap finds out by comparing
/// addresses.
pub trait HeapGrower {
    type Err;

    /// The region the heap begins with, before any growth. Called exactly
    /// once, lazily, on first use of the heap.
    ///
    /// # Safety
    ///
    /// The returned region must be valid for reads and writes of `len`
    /// bytes, stay put for the lifetime of the heap, and be used by nothing
    /// else.
    unsafe fn initial_region(&mut self) -> (NonNull<u8>, usize);

    /// Grows the heap by at least `size` bytes. Returns the first address of
    /// the new region and the granted length.
    ///
    /// # Safety
    ///
    /// On success the returned memory must be valid for reads and writes of
    /// the granted length and owned exclusively by the heap from now on.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;
}

/// The single inaccessible span between the old end of the heap and a
/// non-contiguous extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Gap {
    pub start: *mut u8,
    pub end: *mut u8,
}

impl Gap {
    pub fn len(&self) -> usize {
        self.end as usize - self.start as usize
    }

    fn contains(&self, addr: *mut u8) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The heap engine: cursor trio, optional gap, segregated free lists, and
/// the grower that feeds it.
///
/// The cursors are captured lazily on first allocation, so a fresh `Heap`
/// can be moved around freely. Once the first allocation has happened the
/// value must stay put: free-list links point into the grower's memory, and
/// for in-array growers like the test heap, into the value itself.
pub struct Heap<G> {
    grower: G,
    start: *mut u8,
    top: *mut u8,
    end: *mut u8,
    gap: Option<Gap>,
    free: FreeTable,
}

// A Heap can move to another thread as a whole: the pointers it holds all
// target memory owned by the heap itself (or by its grower), so sending the
// complete bundle is fine. What it is not is Sync; concurrent access needs
// the lock layered on in `allocators`.
unsafe impl<G: Send> Send for Heap<G> {}

impl<G: HeapGrower> Heap<G> {
    pub fn new(grower: G) -> Self {
        Heap {
            grower,
            start: ptr::null_mut(),
            top: ptr::null_mut(),
            end: ptr::null_mut(),
            gap: None,
            free: FreeTable::new(),
        }
    }

    /// Captures the initial region from the grower, once.
    unsafe fn ensure_init(&mut self) {
        if !self.start.is_null() {
            return;
        }
        let (region, len) = self.grower.initial_region();
        let base = region.as_ptr();
        // Trim to word boundaries; growers normally hand over aligned
        // memory and this is a no-op.
        let start = align(base as usize) as *mut u8;
        let end = ((base as usize + len) & SIZE_MASK) as *mut u8;
        self.start = start;
        self.top = start;
        self.end = end;
        log::debug!(
            "heap arena {:p}..{:p} ({} bytes)",
            start,
            end,
            end as usize - start as usize
        );
    }

    /// Allocates a block of exactly `total` bytes (header and footer
    /// included; word-aligned; at least the minimum block size) and returns
    /// its payload address, or `None` when the grower cannot extend the
    /// heap any further.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid for writes of `total` minus the two
    /// metadata words. The heap must not be moved once this has been called.
    pub unsafe fn allocate(&mut self, total: usize) -> Option<NonNull<u8>> {
        debug_assert!(total >= MIN_BLOCK_SIZE);
        debug_assert!(total % WORD_SIZE == 0);
        self.ensure_init();

        // Reuse a freed block if any bucket holds one big enough.
        if let Some(mut block) = self.free.first_fit(total) {
            self.free.remove(block);
            self.split_if_possible(block, total);
            block.setup(block.size(), true);
            log::debug!("reusing {:?} for {} bytes", block, total);
            return Some(block.payload());
        }

        // Otherwise carve fresh memory at the watermark.
        if self.top as usize + total <= self.end as usize {
            let mut block = BlockPtr::from_raw(self.top);
            block.setup(total, true);
            self.top = self.top.add(total);
            log::debug!("carved {:?} at the watermark", block);
            return Some(block.payload());
        }

        self.grow(total)
    }

    /// Releases a heap block: clears the used bit, merges with free
    /// neighbors, and files the survivor back into its bucket.
    ///
    /// # Safety
    ///
    /// `block` must be a live heap block of this heap (not an mmap block).
    /// Double release and wild pointers are undefined behaviour.
    pub unsafe fn free_block(&mut self, mut block: BlockPtr) {
        debug_assert!(!block.is_mmapped());
        block.setup(block.size(), false);
        let merged = self.coalesce(block);
        self.free.insert(merged);
    }

    /// Splits `block` into a `needed`-sized prefix and a free remainder, if
    /// the remainder could stand alone as a block. The remainder goes into
    /// the free table; `block`'s header is trimmed but it is not marked used
    /// here. `block` must already be unlinked.
    unsafe fn split_if_possible(&mut self, mut block: BlockPtr, needed: usize) {
        let current = block.size();
        if current < needed + MIN_BLOCK_SIZE {
            // The leftover could not hold links and metadata; hand out the
            // whole block and accept the internal slack.
            return;
        }

        block.setup(needed, false);
        let mut remainder = block.next_physical();
        remainder.setup(current - needed, false);
        self.free.insert(remainder);
        log::debug!(
            "split {} bytes into {} + {}",
            current,
            needed,
            current - needed
        );
    }

    /// Merges `block` with its physical neighbors where they are free and
    /// addressable, returning the surviving (lowest-addressed) block. The
    /// caller inserts the survivor into the free table.
    ///
    /// The addressability checks are what keeps this sound across the gap:
    /// an address is only trusted as block metadata if it lies in
    /// `[start, top)` and outside the gap. A block sitting at `start` or at
    /// the first address of the extension region has no predecessor, no
    /// matter what the bytes before it look like.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let mut survivor = block;
        let mut new_size = block.size();

        let next = block.next_physical();
        if self.is_addressable(next.addr()) && !next.is_used() {
            self.free.remove(next);
            new_size += next.size();
        }

        let region_first = block.addr() == self.start
            || self.gap.map_or(false, |gap| block.addr() == gap.end);
        if !region_first {
            let prev_footer = block.addr().sub(FOOTER_SIZE);
            if self.is_addressable(prev_footer) {
                let prev = block.prev_physical();
                if self.is_addressable(prev.addr()) && !prev.is_used() {
                    self.free.remove(prev);
                    new_size += prev.size();
                    survivor = prev;
                }
            }
        }

        survivor.setup(new_size, false);
        survivor
    }

    /// The growth protocol. Asks the grower for at least `total` bytes and
    /// reconciles the answer with the current region: a contiguous grant
    /// just moves `end`; a displaced grant records the one allowed gap and
    /// rescues the residual slack of the old region as a free block when it
    /// is big enough. Finally the requested block is carved at the (possibly
    /// relocated) watermark.
    unsafe fn grow(&mut self, total: usize) -> Option<NonNull<u8>> {
        let (region, granted) = match self.grower.grow_heap(total) {
            Ok(grant) => grant,
            Err(_) => {
                log::warn!("heap growth of {} bytes failed, out of memory", total);
                return None;
            }
        };
        let region = region.as_ptr();
        debug_assert!(granted >= total);

        if region == self.end {
            log::debug!("contiguous extension of {} bytes", granted);
            self.end = self.end.add(granted);
        } else {
            if self.gap.is_some() {
                // Only one discontinuity is representable. The fresh region
                // cannot be handed back (the break only moves up), so it
                // stays unused.
                log::warn!(
                    "second non-contiguous extension at {:p}, out of memory",
                    region
                );
                return None;
            }

            let residual = self.end as usize - self.top as usize;
            if residual >= MIN_BLOCK_SIZE {
                let mut sliver = BlockPtr::from_raw(self.top);
                sliver.setup(residual, false);
                self.free.insert(sliver);
                self.gap = Some(Gap {
                    start: self.end,
                    end: region,
                });
            } else {
                // Too small to stand alone; fold the sliver into the gap so
                // physical walks stay exact.
                self.gap = Some(Gap {
                    start: self.top,
                    end: region,
                });
            }
            log::debug!(
                "displaced extension at {:p}, gap {:?}",
                region,
                self.gap.unwrap()
            );
            self.top = region;
            self.end = region.add(granted);
        }

        let mut block = BlockPtr::from_raw(self.top);
        block.setup(total, true);
        self.top = self.top.add(total);
        Some(block.payload())
    }

    /// Whether `addr` may be read as block metadata: inside the live span
    /// and not in the gap.
    fn is_addressable(&self, addr: *mut u8) -> bool {
        addr >= self.start && (addr as usize) < self.top as usize && !self.in_gap(addr)
    }

    fn in_gap(&self, addr: *mut u8) -> bool {
        self.gap.map_or(false, |gap| gap.contains(addr))
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }

    pub fn grower_mut(&mut self) -> &mut G {
        &mut self.grower
    }
}

impl<G> Heap<G> {
    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn top(&self) -> *mut u8 {
        self.top
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    pub fn gap(&self) -> Option<Gap> {
        self.gap
    }

    pub fn free_table(&self) -> &FreeTable {
        &self.free
    }

    /// Walks the physical blocks from `start` to `top`, skipping the gap,
    /// and reports everything a healthy heap should never show along with
    /// counts and byte totals.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        if self.start.is_null() {
            return (validity, stats);
        }

        stats.heap_bytes = self.end as usize - self.start as usize;
        stats.slack = self.end as usize - self.top as usize;
        stats.gap_bytes = self.gap.map_or(0, |gap| gap.len());
        stats.free_list_len = self.free.len();

        let mut cursor = self.start;
        let mut prev_free = false;
        while (cursor as usize) < self.top as usize {
            if let Some(gap) = self.gap {
                if cursor == gap.start {
                    cursor = gap.end;
                    // Blocks on either side of the gap are not neighbors.
                    prev_free = false;
                    continue;
                }
                if gap.contains(cursor) {
                    // A size upstream walked us into the gap.
                    validity.truncations += 1;
                    break;
                }
            }

            let block = unsafe { BlockPtr::from_raw(cursor) };
            let size = block.size();
            if size < MIN_BLOCK_SIZE
                || size % WORD_SIZE != 0
                || cursor as usize + size > self.top as usize
            {
                validity.bad_sizes += 1;
                validity.truncations += 1;
                break;
            }
            if block.footer_word() != block.header_word() {
                validity.footer_mismatches += 1;
            }

            stats.blocks += 1;
            if block.is_used() {
                stats.used_blocks += 1;
                stats.used_bytes += size;
                prev_free = false;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if prev_free {
                    validity.adjacent_frees += 1;
                }
                if !self.free.contains(block) {
                    validity.unlisted_frees += 1;
                }
                prev_free = true;
            }

            cursor = unsafe { cursor.add(size) };
        }

        (validity, stats)
    }
}

/// Everything the validity walk found wrong. All zeroes on a healthy heap.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose footer does not mirror the header. Indicates the caller
    /// wrote past a payload, or worse.
    pub footer_mismatches: usize,

    /// Blocks whose size is below the minimum, not word-aligned, or running
    /// past `top`.
    pub bad_sizes: usize,

    /// Pairs of physically adjacent free blocks. Coalescing is supposed to
    /// make these impossible.
    pub adjacent_frees: usize,

    /// Free blocks missing from the bucket their size maps to.
    pub unlisted_frees: usize,

    /// Walks that had to stop early because the block chain no longer added
    /// up.
    pub truncations: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.footer_mismatches == 0
            && self.bad_sizes == 0
            && self.adjacent_frees == 0
            && self.unlisted_frees == 0
            && self.truncations == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

/// Byte and block counts from the physical walk.
#[derive(Default, Debug)]
pub struct Stats {
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Bytes between `top` and `end`, carvable without growth.
    pub slack: usize,
    /// Length of the recorded gap, zero if none.
    pub gap_bytes: usize,
    /// Total span `end - start`, gap included.
    pub heap_bytes: usize,
    /// Blocks threaded into the segregated table.
    pub free_list_len: usize,
}

impl<G> fmt::Display for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.is_null() {
            return writeln!(f, "heap: (uninitialized)");
        }

        writeln!(
            f,
            "heap: start={:p} top={:p} end={:p} ({} bytes, {} slack)",
            self.start,
            self.top,
            self.end,
            self.end as usize - self.start as usize,
            self.end as usize - self.top as usize,
        )?;
        match self.gap {
            Some(gap) => writeln!(
                f,
                "gap: {:p}..{:p} ({} bytes, unusable)",
                gap.start,
                gap.end,
                gap.len()
            )?,
            None => writeln!(f, "gap: none")?,
        }

        let mut cursor = self.start;
        let mut index = 0;
        while (cursor as usize) < self.top as usize {
            if let Some(gap) = self.gap {
                if cursor == gap.start {
                    writeln!(f, "  -- gap, {} bytes --", gap.len())?;
                    cursor = gap.end;
                    continue;
                }
                if gap.contains(cursor) {
                    writeln!(f, "  [!] walk entered the gap at {:p}, stopping", cursor)?;
                    break;
                }
            }
            let block = unsafe { BlockPtr::from_raw(cursor) };
            let size = block.size();
            if size < MIN_BLOCK_SIZE || size % WORD_SIZE != 0 {
                writeln!(f, "  [!] invalid block at {:p} (size={}), stopping", cursor, size)?;
                break;
            }
            writeln!(f, "  #{} {:?}", index, block)?;
            index += 1;
            cursor = unsafe { cursor.add(size) };
        }

        write!(f, "{}", self.free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::ToyHeap;
    use crate::freelist::bucket_index;
    use crate::INITIAL_HEAP_SIZE;

    use test_log::test;

    fn assert_healthy<G>(heap: &Heap<G>) {
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "heap invalid: {:?}", validity);
        assert_eq!(
            stats.used_bytes + stats.free_bytes + stats.slack + stats.gap_bytes,
            stats.heap_bytes,
            "bytes unaccounted for: {:?}",
            stats
        );
        assert_eq!(stats.free_blocks, stats.free_list_len);
    }

    #[test]
    fn carve_then_reuse_same_address() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let p1 = heap.allocate(80).unwrap();
            heap.free_block(BlockPtr::from_payload(p1));
            let p2 = heap.allocate(80).unwrap();
            assert_eq!(p1, p2);
        }
        assert_healthy(&heap);
    }

    #[test]
    fn split_files_remainder_in_right_bucket() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let p = heap.allocate(512).unwrap();
            let block = BlockPtr::from_payload(p);
            heap.free_block(block);
            assert!(heap.free_table().contains(block));

            // asking for a quarter of it splits the block
            let q = heap.allocate(128).unwrap();
            assert_eq!(q, p);
            let taken = BlockPtr::from_payload(q);
            assert_eq!(taken.size(), 128);

            let remainder = taken.next_physical();
            assert_eq!(remainder.size(), 384);
            assert!(!remainder.is_used());
            assert_eq!(bucket_index(384), 4);
            assert!(heap.free_table().contains(remainder));
        }
        assert_healthy(&heap);
    }

    #[test]
    fn no_split_when_remainder_too_small() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let p = heap.allocate(96).unwrap();
            heap.free_block(BlockPtr::from_payload(p));

            // 96 < 80 + MIN_BLOCK_SIZE, so the block is handed out whole
            let q = heap.allocate(80).unwrap();
            assert_eq!(q, p);
            assert_eq!(BlockPtr::from_payload(q).size(), 96);
            assert!(heap.free_table().is_empty());
        }
        assert_healthy(&heap);
    }

    #[test]
    fn coalesce_merges_in_any_order() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let a = heap.allocate(32).unwrap();
            let b = heap.allocate(32).unwrap();
            let c = heap.allocate(32).unwrap();

            // outer blocks first, middle one last: the middle release has a
            // free neighbor on both sides and must merge all three
            heap.free_block(BlockPtr::from_payload(a));
            heap.free_block(BlockPtr::from_payload(c));
            heap.free_block(BlockPtr::from_payload(b));

            assert_eq!(heap.free_table().len(), 1);
            let merged = BlockPtr::from_payload(a);
            assert_eq!(merged.size(), 96);
            assert!(heap.free_table().contains(merged));

            // and the merged block is reusable from its lowest address
            let p = heap.allocate(96).unwrap();
            assert_eq!(p, a);
        }
        assert_healthy(&heap);
    }

    #[test]
    fn release_is_maximally_coalesced() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            heap.free_block(BlockPtr::from_payload(a));
            heap.free_block(BlockPtr::from_payload(b));

            let (validity, stats) = heap.stats();
            assert!(validity.is_valid());
            assert_eq!(stats.adjacent_frees, 0);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn contiguous_growth_extends_end() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let base = heap.grower_mut().base();
            let _big = heap.allocate(4000).unwrap();

            // does not fit in the 96 bytes of slack; the toy break sits
            // right at `end`, so the extension is contiguous
            let p = heap.allocate(200).unwrap();
            assert!(heap.gap().is_none());
            assert_eq!(heap.end(), base.wrapping_add(INITIAL_HEAP_SIZE + 256));
            // the new block was still carved from the old slack
            assert_eq!(p.as_ptr(), base.wrapping_add(4000 + 8));
        }
        assert_healthy(&heap);
    }

    #[test]
    fn displaced_growth_records_gap_and_rescues_residual() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let base = heap.grower_mut().base();
            let _a = heap.allocate(2064).unwrap();
            let _b = heap.allocate(1040).unwrap();
            // 992 bytes of slack remain

            heap.grower_mut().skip_next = 64;
            let c = heap.allocate(1216).unwrap();

            let gap = heap.gap().expect("growth should have recorded a gap");
            assert_eq!(gap.start, base.wrapping_add(INITIAL_HEAP_SIZE));
            assert_eq!(gap.end, base.wrapping_add(INITIAL_HEAP_SIZE + 64));
            assert_eq!(c.as_ptr(), gap.end.wrapping_add(8));

            // the residual slack became a free block in the >512 bucket
            let sliver = BlockPtr::from_raw(base.add(3104));
            assert_eq!(sliver.size(), 992);
            assert!(!sliver.is_used());
            assert!(heap.free_table().contains(sliver));
            assert_eq!(bucket_index(sliver.size()), 5);

            // and it is still allocatable across the gap
            let d = heap.allocate(992).unwrap();
            assert_eq!(d.as_ptr(), base.wrapping_add(3104 + 8));
        }
        assert_healthy(&heap);
    }

    #[test]
    fn first_block_after_gap_has_no_predecessor() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let _a = heap.allocate(2064).unwrap();
            let _b = heap.allocate(1040).unwrap();
            heap.grower_mut().skip_next = 64;
            let c = heap.allocate(1216).unwrap();

            // releasing the first block of the extension region must not
            // read the word before it as a footer; the free sliver of the
            // old region would otherwise get merged across the gap
            heap.free_block(BlockPtr::from_payload(c));
            let (validity, stats) = heap.stats();
            assert!(validity.is_valid());
            assert_eq!(stats.free_blocks, 2);
        }
        assert_healthy(&heap);
    }

    #[test]
    fn unusable_sliver_is_folded_into_gap() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let base = heap.grower_mut().base();
            let _a = heap.allocate(2064).unwrap();
            let _b = heap.allocate(2016).unwrap();
            // 16 bytes of slack: too small to stand alone

            heap.grower_mut().skip_next = 64;
            let _c = heap.allocate(320).unwrap();

            let gap = heap.gap().unwrap();
            assert_eq!(gap.start, base.wrapping_add(4080));
            assert_eq!(gap.end, base.wrapping_add(INITIAL_HEAP_SIZE + 64));
            assert!(heap.free_table().is_empty());
        }
        assert_healthy(&heap);
    }

    #[test]
    fn second_displaced_growth_is_refused() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            let _a = heap.allocate(4064).unwrap();
            heap.grower_mut().skip_next = 64;
            let b = heap.allocate(640);
            assert!(b.is_some());
            assert!(heap.gap().is_some());

            // a second displaced extension cannot be represented
            heap.grower_mut().skip_next = 64;
            let c = heap.allocate(640);
            assert!(c.is_none());
        }
        assert_healthy(&heap);
    }

    #[test]
    fn growth_failure_reports_out_of_memory() {
        let mut heap = Heap::new(ToyHeap::default());
        unsafe {
            // more than the toy heap can ever grant
            let p = heap.allocate(crate::allocators::TOY_HEAP_SIZE + 4096);
            assert!(p.is_none());
        }
        assert_healthy(&heap);
    }
}
