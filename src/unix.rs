//! Thin wrappers over the libc memory primitives: program-break
//! advancement, anonymous mappings, and the page size. Failures come back
//! as `Errno` so callers can log something useful before turning them into
//! null returns.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use errno::{errno, Errno};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The system page size, fetched from sysconf once and cached. Falls back
/// to 4096 if sysconf errors out.
pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let fetched = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let value = if fetched > 0 { fetched as usize } else { 4096 };
    PAGE_SIZE.store(value, Ordering::Relaxed);
    value
}

/// Advances the program break by `increment` bytes and returns the first
/// address of the fresh region (the old break).
///
/// # Safety
///
/// The break is a process-wide cursor; the caller owns the coordination.
pub(crate) unsafe fn sbrk(increment: usize) -> Result<NonNull<u8>, Errno> {
    let previous = libc::sbrk(increment as libc::intptr_t);
    if previous as isize == -1 {
        Err(errno())
    } else {
        Ok(NonNull::new_unchecked(previous.cast()))
    }
}

/// Maps `length` bytes of zeroed memory, readable and writable, private to
/// this process and backed by no file.
///
/// # Safety
///
/// `length` must be nonzero.
pub(crate) unsafe fn mmap_anon(length: usize) -> Result<NonNull<u8>, Errno> {
    let region = libc::mmap(
        ptr::null_mut(),
        length,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if region == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new_unchecked(region.cast()))
    }
}

/// Unmaps a region previously obtained from [`mmap_anon`].
///
/// # Safety
///
/// `addr` and `length` must describe exactly one live mapping.
pub(crate) unsafe fn munmap(addr: *mut u8, length: usize) {
    if libc::munmap(addr.cast(), length) != 0 {
        log::warn!("munmap({:p}, {}) failed: {}", addr, length, errno());
    }
}
