//! Segregated free lists.
//!
//! Free blocks are kept in six doubly linked lists, one per size class. The
//! links live inside the free blocks themselves (see [`crate::block`]), so
//! the table is just an array of list heads and never allocates.
//!
//! The class boundaries are fixed:
//!
//! | bucket | block size (bytes) |
//! |--------|--------------------|
//! | 0      | ≤ 32               |
//! | 1      | 33–64              |
//! | 2      | 65–128             |
//! | 3      | 129–256            |
//! | 4      | 257–512            |
//! | 5      | > 512              |
//!
//! A block is filed under the class of its size *at insertion time*, and a
//! listed block is never resized in place (splitting and coalescing both
//! unlink first). Searches still have to sweep forward past the target
//! bucket, because splits and merges move blocks between classes over their
//! lifetime and a bigger-class block is always an acceptable answer.

use core::fmt;

use crate::block::BlockPtr;

/// Number of size classes.
pub const NUM_BUCKETS: usize = 6;

/// Upper size bound of each bucket except the last, which is unbounded.
const BUCKET_LIMITS: [usize; NUM_BUCKETS - 1] = [32, 64, 128, 256, 512];

/// Human-readable bucket ranges, used by the dump.
const BUCKET_LABELS: [&str; NUM_BUCKETS] = [
    "<=32", "33-64", "65-128", "129-256", "257-512", ">512",
];

/// Maps a total block size to its bucket index.
#[inline]
pub fn bucket_index(size: usize) -> usize {
    for (index, limit) in BUCKET_LIMITS.iter().enumerate() {
        if size <= *limit {
            return index;
        }
    }
    NUM_BUCKETS - 1
}

/// The segregated free-list table: one LIFO doubly linked list per size
/// class, threaded through the free blocks' bodies.
pub struct FreeTable {
    heads: [Option<BlockPtr>; NUM_BUCKETS],
}

impl FreeTable {
    pub const fn new() -> Self {
        FreeTable {
            heads: [None; NUM_BUCKETS],
        }
    }

    /// Pushes `block` onto the head of its bucket.
    ///
    /// # Safety
    ///
    /// `block` must be a valid free block that is not currently in any list.
    /// Its header must hold its final size; the bucket is chosen from it.
    pub unsafe fn insert(&mut self, mut block: BlockPtr) {
        let index = bucket_index(block.size());

        block.set_next_free(self.heads[index]);
        block.set_prev_free(None);

        if let Some(mut old_head) = self.heads[index] {
            old_head.set_prev_free(Some(block));
        }

        self.heads[index] = Some(block);
        log::trace!("freelist: insert {:?} into bucket {}", block, index);
    }

    /// Unlinks `block` from its bucket and nullifies its links.
    ///
    /// # Safety
    ///
    /// `block` must currently be threaded into the table, and its size must
    /// not have changed since insertion (that is what locates the head slot
    /// when the block has no predecessor).
    pub unsafe fn remove(&mut self, mut block: BlockPtr) {
        match block.prev_free() {
            Some(mut prev) => prev.set_next_free(block.next_free()),
            None => {
                // No predecessor means this block is a bucket head.
                let index = bucket_index(block.size());
                debug_assert_eq!(self.heads[index], Some(block));
                self.heads[index] = block.next_free();
            }
        }

        if let Some(mut next) = block.next_free() {
            next.set_prev_free(block.prev_free());
        }

        block.set_next_free(None);
        block.set_prev_free(None);
        log::trace!("freelist: remove {:?}", block);
    }

    /// First-fit search: starting at the bucket for `size` and sweeping
    /// forward through bucket 5, returns the first block big enough to hold
    /// `size` bytes, or `None`.
    ///
    /// The forward sweep is load-bearing. A block that was split keeps
    /// sitting in its old (larger) bucket's range of addresses, and a merge
    /// grows a block past its class before re-insertion, so the exact bucket
    /// alone cannot be trusted to contain every candidate.
    pub fn first_fit(&self, size: usize) -> Option<BlockPtr> {
        for index in bucket_index(size)..NUM_BUCKETS {
            for block in self.iter_bucket(index) {
                if block.size() >= size {
                    return Some(block);
                }
            }
        }
        None
    }

    /// Iterates one bucket front to back.
    pub fn iter_bucket(&self, index: usize) -> BucketIter {
        BucketIter {
            next: self.heads[index],
        }
    }

    /// Whether `block` is currently threaded into the bucket its size maps
    /// to. Only used by the validity walk.
    pub fn contains(&self, block: BlockPtr) -> bool {
        self.iter_bucket(bucket_index(block.size()))
            .any(|candidate| candidate == block)
    }

    /// Total number of listed blocks across all buckets.
    pub fn len(&self) -> usize {
        (0..NUM_BUCKETS).map(|i| self.iter_bucket(i).count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }
}

impl Default for FreeTable {
    fn default() -> Self {
        FreeTable::new()
    }
}

/// Iterator over one bucket's chain.
///
/// The iterator trusts the list invariants; it must not outlive a mutation
/// of the table.
pub struct BucketIter {
    next: Option<BlockPtr>,
}

impl Iterator for BucketIter {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = unsafe { block.next_free() };
        Some(block)
    }
}

impl fmt::Display for FreeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, label) in BUCKET_LABELS.iter().enumerate() {
            write!(f, "list[{}] ({}):", index, label)?;
            let mut count = 0;
            for block in self.iter_bucket(index) {
                if count == 10 {
                    write!(f, " ...")?;
                    break;
                }
                write!(f, " {:p}({})", block.addr(), block.size())?;
                count += 1;
            }
            if count == 0 {
                write!(f, " (empty)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
