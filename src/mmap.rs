//! The large-block collaborator.
//!
//! Requests at or above the mmap threshold never touch the heap engine.
//! Each one gets its own anonymous private mapping with a block header in
//! the first word and the payload right after it:
//!
//! ```text
//! +------------------+
//! | header           |  <- mapped length | USED | MMAPED
//! +------------------+
//! | payload          |
//! |   ...            |
//! +------------------+
//! | page-rounding    |  <- slack up to the page boundary, unused
//! +------------------+
//! ```
//!
//! No footer is written and the block joins no free list; the `MMAPED` bit
//! in the header is what routes the release back here, where the whole
//! mapping is returned to the kernel in one piece.

use core::ptr::null_mut;

use crate::block::{round_up, BlockPtr, HEADER_SIZE, MMAP_FLAG, SIZE_MASK, USED_FLAG};
use crate::unix;

/// Live-mapping counters, kept for inspection only.
#[derive(Copy, Clone, Debug, Default)]
pub struct MapStats {
    /// Mappings currently live.
    pub mappings: usize,
    /// Bytes currently mapped, page rounding included.
    pub mapped_bytes: usize,
}

/// Maps a fresh block able to hold `aligned_size` payload bytes and returns
/// the payload address, or null if the kernel refuses.
///
/// # Safety
///
/// `aligned_size` must be word-aligned.
pub(crate) unsafe fn map_block(aligned_size: usize, stats: &mut MapStats) -> *mut u8 {
    let length = round_up(HEADER_SIZE + aligned_size, unix::page_size());

    let region = match unix::mmap_anon(length) {
        Ok(region) => region,
        Err(err) => {
            log::warn!("mmap of {} bytes failed: {}", length, err);
            return null_mut();
        }
    };

    let mut block = BlockPtr::from_raw(region.as_ptr());
    // Written as a raw word: the heap engine's header helpers deliberately
    // never set MMAP_FLAG, so this path does not go through them.
    block.write_header_word((length & SIZE_MASK) | USED_FLAG | MMAP_FLAG);

    stats.mappings += 1;
    stats.mapped_bytes += length;
    log::debug!("mapped large block {:?}", block);

    block.payload().as_ptr()
}

/// Returns a mapped block's whole region to the kernel.
///
/// # Safety
///
/// `block` must have been produced by [`map_block`] and not yet unmapped.
pub(crate) unsafe fn unmap_block(block: BlockPtr, stats: &mut MapStats) {
    let length = block.size();

    stats.mappings -= 1;
    stats.mapped_bytes -= length;
    log::debug!("unmapping large block {:?}", block);

    unix::munmap(block.addr(), length);
}
