// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{MemError, VirtualRegion};
use core::ptr::NonNull;
use util::align_up;

/// A monotonic bump allocator over a [`VirtualRegion`].
///
/// Allocations never move and are never individually freed; [`Arena::reset`]
/// rewinds the bump pointer without decommitting, and dropping the arena
/// releases the whole reservation. Physical pages are committed lazily as
/// the bump pointer crosses the commit watermark.
#[derive(Debug)]
pub struct Arena {
    region: VirtualRegion,
    next: usize,
}

// === impl Arena ===

impl Arena {
    /// Reserve `reserve` bytes and commit the first `initial_commit` of them.
    ///
    /// # Errors
    ///
    /// Fails with [`MemError::InvalidArgument`] if `initial_commit` exceeds
    /// `reserve`, otherwise propagates reservation/commit failures.
    pub fn create(reserve: usize, initial_commit: usize) -> Result<Self, MemError> {
        if initial_commit > reserve {
            return Err(MemError::InvalidArgument);
        }
        let region = VirtualRegion::reserve(reserve)?;
        region.commit(0, initial_commit)?;
        Ok(Self { region, next: 0 })
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    ///
    /// Commits additional pages when the allocation crosses the committed
    /// watermark. No partial allocation is ever returned: on failure the
    /// bump pointer is unchanged.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] for zero sizes or non-power-of-two
    /// alignments, [`MemError::OutOfReserve`] when the reservation is
    /// exhausted, [`MemError::OsError`] when the commit fails.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MemError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(MemError::InvalidArgument);
        }
        let offset = align_up(self.next, align);
        let end = offset.checked_add(size).ok_or(MemError::InvalidArgument)?;
        if end > self.region.reserved() {
            return Err(MemError::OutOfReserve);
        }
        if end > self.region.committed() {
            self.region.commit(offset, size)?;
        }
        self.next = end;
        tracing::trace!(offset, size, align, "arena alloc");
        // Safety: offset is within the reservation.
        Ok(unsafe { util::non_null(self.region.as_ptr(offset)) })
    }

    /// Bump-allocate storage for `n` values of `T`, aligned for `T`.
    ///
    /// The returned memory is zeroed (fresh pages come zeroed from the OS
    /// and the arena never reuses freed space before a [`reset`]).
    ///
    /// [`reset`]: Arena::reset
    ///
    /// # Errors
    ///
    /// See [`Arena::alloc`].
    pub fn alloc_array<T>(&mut self, n: usize) -> Result<NonNull<T>, MemError> {
        let size = core::mem::size_of::<T>()
            .checked_mul(n)
            .ok_or(MemError::InvalidArgument)?;
        Ok(self.alloc(size, core::mem::align_of::<T>())?.cast::<T>())
    }

    /// Rewind the bump pointer to the start of the arena.
    ///
    /// Committed pages stay committed (and keep their contents); all
    /// previously returned pointers must be considered dangling by the
    /// caller.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Bytes currently allocated out of the arena.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.next
    }

    /// The base address of the arena. Never changes.
    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    #[inline]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.region.reserved()
    }

    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.region.committed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIB;

    #[test]
    fn allocations_are_aligned_and_monotonic() {
        let mut arena = Arena::create(4 * MIB, 0).unwrap();
        let a = arena.alloc(3, 1).unwrap();
        let b = arena.alloc(64, 64).unwrap();
        let c = arena.alloc(1, 8).unwrap();

        assert_eq!(b.as_ptr() as usize % 64, 0);
        assert_eq!(c.as_ptr() as usize % 8, 0);
        assert!((a.as_ptr() as usize) < (b.as_ptr() as usize));
        assert!((b.as_ptr() as usize) < (c.as_ptr() as usize));
    }

    #[test]
    fn commit_grows_on_demand() {
        let mut arena = Arena::create(MIB, 0).unwrap();
        assert_eq!(arena.committed(), 0);
        arena.alloc(128 * 1024, 64).unwrap();
        assert!(arena.committed() >= 128 * 1024);
    }

    #[test]
    fn out_of_reserve_reports_and_leaves_state() {
        let mut arena = Arena::create(64 * 1024, 0).unwrap();
        arena.alloc(60 * 1024, 64).unwrap();
        let used = arena.used();
        assert_eq!(arena.alloc(16 * 1024, 64), Err(MemError::OutOfReserve));
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn bad_alignment_rejected() {
        let mut arena = Arena::create(MIB, 0).unwrap();
        assert_eq!(arena.alloc(16, 3), Err(MemError::InvalidArgument));
        assert_eq!(arena.alloc(0, 8), Err(MemError::InvalidArgument));
    }

    #[test]
    fn reset_rewinds_without_decommit() {
        let mut arena = Arena::create(MIB, 0).unwrap();
        let first = arena.alloc(4096, 64).unwrap();
        let committed = arena.committed();
        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.committed(), committed);
        let again = arena.alloc(4096, 64).unwrap();
        assert_eq!(first.as_ptr(), again.as_ptr());
    }
}
