//! Block metadata primitives.
//!
//! Every allocation handed out by the heap engine is a *block*:
//!
//! ```text
//! +-----------------+
//! | header (1 word) |  <- size | flag bits
//! +-----------------+
//! |      body       |  <- payload when used,
//! |       ...       |     free-list links when free
//! +-----------------+
//! | footer (1 word) |  <- copy of the header
//! +-----------------+
//! ```
//!
//! The header packs the total block size together with two flag bits. Sizes
//! are always multiples of the machine word, so the low bits of a size are
//! guaranteed zero and can carry the flags. The footer mirrors the header so
//! that the block *before* any given block can be located in O(1): the word
//! immediately before a header is the previous block's footer, and the
//! previous block's size is right there in it.
//!
//! When a block is free, the first two words of its body hold the intrusive
//! `next_free`/`prev_free` links used by [`crate::freelist`]. When it is
//! used, those same bytes belong to the caller. The minimum block size
//! exists precisely so that any freed block can hold both links.
//!
//! All raw-pointer traffic of the crate funnels through [`BlockPtr`]:
//! constructing one is unsafe, reads trust the construction invariant, and
//! mutators that can corrupt the heap are unsafe again.

use core::fmt;
use core::mem;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Size of a machine word in bytes. Also the alignment of every payload
/// pointer this allocator returns.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// The header is a single word.
pub const HEADER_SIZE: usize = WORD_SIZE;

/// The footer is a copy of the header.
pub const FOOTER_SIZE: usize = WORD_SIZE;

/// Smallest block we ever create: header, room for the two free-list links,
/// and footer. Anything smaller could not be threaded back into a free list
/// after release.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 2 * WORD_SIZE + FOOTER_SIZE;

/// Bit 0 of the header: the block is currently allocated.
pub const USED_FLAG: usize = 0b01;

/// Bit 1 of the header: the block came from the large-block mmap path and
/// lives outside the heap regions. Such blocks have no footer.
pub const MMAP_FLAG: usize = 0b10;

/// Masks the flag bits out of a header word, leaving the size.
pub const SIZE_MASK: usize = !(WORD_SIZE - 1);

// Word-aligned sizes must leave room for both flag bits.
const_assert!(WORD_SIZE >= 4);
const_assert!(MIN_BLOCK_SIZE % WORD_SIZE == 0);

/// Rounds `n` up to the next multiple of the word size.
#[inline]
pub fn align(n: usize) -> usize {
    (n + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Rounds `value` up to the nearest multiple of `increment`.
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// A pointer to a block header.
///
/// This is a plain copyable address wrapper, not an owning handle. It exists
/// so that all reinterpretation of heap bytes as headers, footers, and list
/// links happens in one place; everything above this module works in terms
/// of `BlockPtr` and never touches raw words itself.
///
/// Invariant: a `BlockPtr` points at the header word of a block that was
/// laid out by this allocator. The safe read methods rely on that; both
/// constructors are `unsafe` because they are where the invariant is
/// established.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct BlockPtr {
    header: NonNull<usize>,
}

impl BlockPtr {
    /// Interprets `addr` as the address of a block header.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, word-aligned, and point at memory this
    /// allocator laid a block header into (or is about to; the growth and
    /// mmap paths build fresh headers through this constructor).
    #[inline]
    pub unsafe fn from_raw(addr: *mut u8) -> Self {
        BlockPtr {
            header: NonNull::new_unchecked(addr.cast()),
        }
    }

    /// Recovers the block from a payload pointer by stepping back over the
    /// header word.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously returned by this allocator and
    /// not yet released. Anything else is the caller's undefined behaviour,
    /// not ours.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        BlockPtr {
            header: NonNull::new_unchecked(payload.as_ptr().cast::<usize>().offset(-1)),
        }
    }

    /// Address of the header word.
    #[inline]
    pub fn addr(self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    /// Address of the body, one word past the header. This is what callers
    /// receive.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header.as_ptr().add(1).cast()) }
    }

    /// The raw header word.
    #[inline]
    pub fn header_word(self) -> usize {
        unsafe { self.header.as_ptr().read() }
    }

    /// Total block size in bytes, header and footer included.
    #[inline]
    pub fn size(self) -> usize {
        self.header_word() & SIZE_MASK
    }

    #[inline]
    pub fn is_used(self) -> bool {
        self.header_word() & USED_FLAG != 0
    }

    #[inline]
    pub fn is_mmapped(self) -> bool {
        self.header_word() & MMAP_FLAG != 0
    }

    /// The footer word. Equal to the header on every intact heap block.
    ///
    /// Reads through the size stored in the header, so a trampled header
    /// makes this read garbage; that is exactly the corruption the validity
    /// walk reports.
    #[inline]
    pub fn footer_word(self) -> usize {
        unsafe { self.footer_ptr().read() }
    }

    #[inline]
    fn footer_ptr(self) -> *mut usize {
        unsafe { self.addr().add(self.size() - FOOTER_SIZE).cast() }
    }

    /// Rewrites the header as `(size, used)`, clearing the flag bits not
    /// asked for. Heap-engine paths go through here and therefore never
    /// carry `MMAP_FLAG`; the mmap path uses [`Self::write_header_word`]
    /// instead.
    ///
    /// # Safety
    ///
    /// `size` must be word-aligned and describe memory the block actually
    /// owns. Writing a wrong size corrupts physical navigation.
    #[inline]
    pub unsafe fn set_header(&mut self, size: usize, used: bool) {
        let flags = if used { USED_FLAG } else { 0 };
        self.header.as_ptr().write((size & SIZE_MASK) | flags);
    }

    /// Writes a raw header word. Only the large-block path uses this, to set
    /// `USED_FLAG | MMAP_FLAG` in one store.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::set_header`], with the flag bits on the
    /// caller's head.
    #[inline]
    pub unsafe fn write_header_word(&mut self, word: usize) {
        self.header.as_ptr().write(word);
    }

    /// Copies the header into the footer slot.
    ///
    /// # Safety
    ///
    /// The header must already hold the block's final size; the footer
    /// position is computed from it.
    #[inline]
    pub unsafe fn write_footer(self) {
        self.footer_ptr().write(self.header_word());
    }

    /// Sets header and footer in one go.
    ///
    /// # Safety
    ///
    /// Same as [`Self::set_header`] plus [`Self::write_footer`].
    #[inline]
    pub unsafe fn setup(&mut self, size: usize, used: bool) {
        self.set_header(size, used);
        self.write_footer();
    }

    /// The block physically after this one.
    ///
    /// # Safety
    ///
    /// Pure address arithmetic; the result is only meaningful if the
    /// computed address still lies inside a live heap region. The heap's
    /// addressability check decides that, not this function.
    #[inline]
    pub unsafe fn next_physical(self) -> BlockPtr {
        BlockPtr::from_raw(self.addr().add(self.size()))
    }

    /// The block physically before this one, found through its footer (the
    /// word immediately before our header).
    ///
    /// # Safety
    ///
    /// The word before this block must actually be a footer. Blocks at the
    /// start of a region have no predecessor and arbitrary bytes before
    /// them; callers check addressability first.
    #[inline]
    pub unsafe fn prev_physical(self) -> BlockPtr {
        let prev_footer = self.addr().cast::<usize>().offset(-1).read();
        let prev_size = prev_footer & SIZE_MASK;
        BlockPtr::from_raw(self.addr().sub(prev_size))
    }

    // The free-list links live in the first two body words. They are only
    // meaningful while the block is free; the same bytes are caller payload
    // otherwise.

    #[inline]
    fn link_ptr(self, index: usize) -> *mut usize {
        unsafe { self.header.as_ptr().add(1 + index) }
    }

    /// Next block in this block's free-list bucket.
    ///
    /// # Safety
    ///
    /// The block must be free and threaded into a list.
    #[inline]
    pub unsafe fn next_free(self) -> Option<BlockPtr> {
        NonNull::new(self.link_ptr(0).read() as *mut u8).map(|p| BlockPtr::from_raw(p.as_ptr()))
    }

    /// Previous block in this block's free-list bucket.
    ///
    /// # Safety
    ///
    /// The block must be free and threaded into a list.
    #[inline]
    pub unsafe fn prev_free(self) -> Option<BlockPtr> {
        NonNull::new(self.link_ptr(1).read() as *mut u8).map(|p| BlockPtr::from_raw(p.as_ptr()))
    }

    /// # Safety
    ///
    /// The block must be free; this stomps the first body word.
    #[inline]
    pub unsafe fn set_next_free(&mut self, next: Option<BlockPtr>) {
        self.link_ptr(0)
            .write(next.map_or(0, |b| b.addr() as usize));
    }

    /// # Safety
    ///
    /// The block must be free; this stomps the second body word.
    #[inline]
    pub unsafe fn set_prev_free(&mut self, prev: Option<BlockPtr>) {
        self.link_ptr(1)
            .write(prev.map_or(0, |b| b.addr() as usize));
    }
}

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:p}, size={}, {}{})",
            self.addr(),
            self.size(),
            if self.is_used() { "used" } else { "free" },
            if self.is_mmapped() { ", mmapped" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A word-aligned scratch buffer big enough for a few small blocks.
    #[repr(align(8))]
    struct Scratch([u8; 256]);

    #[test]
    fn align_rounds_to_word_multiples() {
        assert_eq!(align(1), WORD_SIZE);
        assert_eq!(align(WORD_SIZE), WORD_SIZE);
        assert_eq!(align(WORD_SIZE + 1), 2 * WORD_SIZE);
        assert_eq!(align(100), 104);
    }

    #[test]
    fn round_up_basics() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn header_and_footer_mirror() {
        let mut scratch = Scratch([0; 256]);
        unsafe {
            let mut block = BlockPtr::from_raw(scratch.0.as_mut_ptr());
            block.setup(64, true);

            assert_eq!(block.size(), 64);
            assert!(block.is_used());
            assert!(!block.is_mmapped());
            assert_eq!(block.footer_word(), block.header_word());

            block.setup(64, false);
            assert!(!block.is_used());
            assert_eq!(block.footer_word(), block.header_word());
        }
    }

    #[test]
    fn payload_round_trip() {
        let mut scratch = Scratch([0; 256]);
        unsafe {
            let mut block = BlockPtr::from_raw(scratch.0.as_mut_ptr());
            block.setup(MIN_BLOCK_SIZE, true);

            let payload = block.payload();
            assert_eq!(payload.as_ptr() as usize, block.addr() as usize + HEADER_SIZE);
            assert_eq!(BlockPtr::from_payload(payload), block);
        }
    }

    #[test]
    fn physical_navigation() {
        let mut scratch = Scratch([0; 256]);
        unsafe {
            let mut first = BlockPtr::from_raw(scratch.0.as_mut_ptr());
            first.setup(64, true);
            let mut second = first.next_physical();
            second.setup(96, false);

            assert_eq!(second.addr() as usize, first.addr() as usize + 64);
            // second's predecessor is found through first's footer
            assert_eq!(second.prev_physical(), first);
        }
    }

    #[test]
    fn free_links() {
        let mut scratch = Scratch([0; 256]);
        unsafe {
            let mut a = BlockPtr::from_raw(scratch.0.as_mut_ptr());
            a.setup(MIN_BLOCK_SIZE, false);
            let mut b = a.next_physical();
            b.setup(MIN_BLOCK_SIZE, false);

            a.set_next_free(Some(b));
            a.set_prev_free(None);
            assert_eq!(a.next_free(), Some(b));
            assert_eq!(a.prev_free(), None);
        }
    }

    #[test]
    fn set_header_clears_mmap_flag() {
        let mut scratch = Scratch([0; 256]);
        unsafe {
            let mut block = BlockPtr::from_raw(scratch.0.as_mut_ptr());
            block.write_header_word(4096 | USED_FLAG | MMAP_FLAG);
            assert!(block.is_mmapped());

            // heap-engine paths rewrite headers through set_header and are
            // never supposed to carry the mmap bit
            block.set_header(64, true);
            assert!(!block.is_mmapped());
            assert!(block.is_used());
        }
    }
}
