// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::MemError;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use util::align_up;

/// Returns the OS page size in bytes.
pub fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).unwrap_or(4096)
}

/// A contiguous reserved virtual address range with an incrementally
/// committed prefix-independent page set.
///
/// The full range is reserved (`PROT_NONE`) at construction; pages become
/// usable only after [`VirtualRegion::commit`]. The base address never
/// changes for the lifetime of the region, so pointers handed out into
/// committed memory stay valid until the region is dropped.
#[derive(Debug)]
pub struct VirtualRegion {
    base: NonNull<u8>,
    reserved: usize,
    /// High watermark of committed bytes, maintained for bookkeeping.
    /// Commit is only ever called by the region's owning thread; the atomic
    /// lets other threads *read* the watermark.
    committed: AtomicUsize,
}

// Safety: the region is a plain (base, len) descriptor; all mutation of the
// underlying pages is governed by the owning data structure's publication
// protocol, and the watermark is atomic.
unsafe impl Send for VirtualRegion {}
// Safety: see above.
unsafe impl Sync for VirtualRegion {}

// === impl VirtualRegion ===

impl VirtualRegion {
    /// Reserve `len` bytes of contiguous address space without committing any
    /// physical memory.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidArgument`] for a zero length and
    /// [`MemError::OsError`] when the reservation itself fails.
    pub fn reserve(len: usize) -> Result<Self, MemError> {
        if len == 0 {
            return Err(MemError::InvalidArgument);
        }
        let len = align_up(len, page_size());

        // Safety: anonymous private mapping, no fd, no fixed address.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemError::last_os_error());
        }

        tracing::trace!(len, ?base, "reserved virtual region");

        Ok(Self {
            // Safety: mmap success implies a non-null page-aligned address.
            base: unsafe { util::non_null(base.cast::<u8>()) },
            reserved: len,
            committed: AtomicUsize::new(0),
        })
    }

    /// Commit the pages covering `offset..offset + len`, making them readable
    /// and writable. Freshly committed pages are zero-filled by the OS.
    ///
    /// Re-committing already committed pages is a no-op at the OS level, so
    /// callers only need to track their own watermarks loosely.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::OutOfReserve`] when the range extends past the
    /// reservation and [`MemError::OsError`] when the commit fails.
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), MemError> {
        if len == 0 {
            return Ok(());
        }
        let page = page_size();
        let start = offset & !(page - 1);
        let end = align_up(offset.checked_add(len).ok_or(MemError::InvalidArgument)?, page);
        if end > self.reserved {
            return Err(MemError::OutOfReserve);
        }

        // Safety: [start, end) lies inside our own reservation.
        let res = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(start).cast::<libc::c_void>(),
                end - start,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if res != 0 {
            return Err(MemError::last_os_error());
        }

        tracing::trace!(start, end, "committed region pages");
        self.committed.fetch_max(end, Ordering::Release);
        Ok(())
    }

    /// The base address of the reservation. Never changes.
    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// A raw pointer `offset` bytes into the reservation.
    ///
    /// The returned pointer is only dereferenceable if the covering pages
    /// have been committed.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.reserved);
        // Safety: offset stays within the reserved range.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Total reserved bytes.
    #[inline]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Committed-byte high watermark.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing can reference it past drop.
        let res = unsafe { libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.reserved) };
        debug_assert_eq!(res, 0, "munmap failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_write() {
        let region = VirtualRegion::reserve(16 * crate::MIB).unwrap();
        assert_eq!(region.committed(), 0);

        region.commit(0, 4096).unwrap();
        assert!(region.committed() >= 4096);

        // Safety: the first page is committed.
        unsafe {
            region.as_ptr(0).write(0xAB);
            region.as_ptr(4095).write(0xCD);
            assert_eq!(region.as_ptr(0).read(), 0xAB);
            assert_eq!(region.as_ptr(4095).read(), 0xCD);
        }
    }

    #[test]
    fn commit_past_reserve_fails() {
        let region = VirtualRegion::reserve(64 * KIB_TEST).unwrap();
        assert_eq!(
            region.commit(60 * KIB_TEST, 8 * KIB_TEST),
            Err(MemError::OutOfReserve)
        );
    }

    #[test]
    fn base_is_stable_across_commits() {
        let region = VirtualRegion::reserve(4 * crate::MIB).unwrap();
        let base = region.base();
        for chunk in 0..8 {
            region.commit(chunk * 64 * KIB_TEST, 64 * KIB_TEST).unwrap();
            assert_eq!(region.base(), base);
        }
    }

    #[test]
    fn zero_reserve_rejected() {
        assert!(matches!(
            VirtualRegion::reserve(0),
            Err(MemError::InvalidArgument)
        ));
    }

    const KIB_TEST: usize = 1024;
}
