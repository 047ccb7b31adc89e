// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::MemError;
use arrayvec::ArrayVec;
use core::ptr::NonNull;
use util::align_up;

/// Maximum number of parallel data streams a single layout can describe.
pub const MAX_STREAMS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Stream {
    size: usize,
    align: usize,
}

/// An ordered list of element sizes describing tightly packed parallel data
/// streams (struct-of-arrays storage).
///
/// A layout is built once with [`MemoryLayout::add`]/[`MemoryLayout::add_bytes`]
/// and is immutable afterwards; it implements `Hash` and `Eq` so callers can
/// compare or intern layouts cheaply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MemoryLayout {
    streams: ArrayVec<Stream, MAX_STREAMS>,
}

/// Resolves `(stream, index)` pairs into typed pointers over one block of
/// memory laid out according to a [`MemoryLayout`] for `count` elements.
///
/// Stream offsets are running sums computed once at construction;
/// [`MemoryView::stream_at`] is a single multiply-add.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView {
    base: NonNull<u8>,
    count: usize,
    stream_count: usize,
    sizes: [usize; MAX_STREAMS],
    offsets: [usize; MAX_STREAMS],
}

// === impl MemoryLayout ===

impl MemoryLayout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stream of `T` elements, returning the stream index.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] when the layout already holds
    /// [`MAX_STREAMS`] streams.
    pub fn add<T>(&mut self) -> Result<usize, MemError> {
        self.add_bytes(core::mem::size_of::<T>(), core::mem::align_of::<T>())
    }

    /// Append a stream of raw `size`/`align` elements, returning the stream
    /// index.
    ///
    /// # Errors
    ///
    /// [`MemError::InvalidArgument`] for zero sizes, non-power-of-two
    /// alignments, or when the layout is full.
    pub fn add_bytes(&mut self, size: usize, align: usize) -> Result<usize, MemError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(MemError::InvalidArgument);
        }
        let index = self.streams.len();
        self.streams
            .try_push(Stream { size, align })
            .map_err(|_| MemError::InvalidArgument)?;
        Ok(index)
    }

    /// Number of streams in the layout.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Total bytes needed to store `count` elements of every stream,
    /// back-to-back with only alignment padding between streams.
    #[must_use]
    pub fn size_for(&self, count: usize) -> usize {
        let mut end = 0usize;
        for stream in &self.streams {
            end = align_up(end, stream.align) + stream.size * count;
        }
        end
    }

    /// Build a [`MemoryView`] resolving this layout over `base` for `count`
    /// elements per stream.
    ///
    /// `base` must be aligned at least as strictly as the most-aligned
    /// stream and point to `size_for(count)` usable bytes.
    #[must_use]
    pub fn view(&self, base: NonNull<u8>, count: usize) -> MemoryView {
        let mut sizes = [0usize; MAX_STREAMS];
        let mut offsets = [0usize; MAX_STREAMS];
        let mut end = 0usize;
        for (i, stream) in self.streams.iter().enumerate() {
            let offset = align_up(end, stream.align);
            sizes[i] = stream.size;
            offsets[i] = offset;
            end = offset + stream.size * count;
        }
        MemoryView {
            base,
            count,
            stream_count: self.streams.len(),
            sizes,
            offsets,
        }
    }
}

// === impl MemoryView ===

impl MemoryView {
    /// Base pointer of stream `s`.
    #[inline]
    #[must_use]
    pub fn stream_ptr(&self, s: usize) -> *mut u8 {
        debug_assert!(s < self.stream_count);
        // Safety: the offset was computed from the layout the block was
        // sized with.
        unsafe { self.base.as_ptr().add(self.offsets[s]) }
    }

    /// Pointer to element `i` of stream `s`: one multiply-add.
    #[inline]
    #[must_use]
    pub fn stream_at(&self, s: usize, i: usize) -> *mut u8 {
        debug_assert!(s < self.stream_count);
        debug_assert!(i < self.count);
        // Safety: see stream_ptr; i is bounds-checked in debug builds.
        unsafe { self.base.as_ptr().add(self.offsets[s] + self.sizes[s] * i) }
    }

    /// Typed pointer to element `i` of stream `s`.
    ///
    /// The stream must have been declared with element type `T` (checked in
    /// debug builds by element size).
    #[inline]
    #[must_use]
    pub fn typed_at<T>(&self, s: usize, i: usize) -> *mut T {
        debug_assert_eq!(self.sizes[s], core::mem::size_of::<T>());
        self.stream_at(s, i).cast::<T>()
    }

    /// Element size of stream `s` in bytes.
    #[inline]
    #[must_use]
    pub fn stream_size(&self, s: usize) -> usize {
        debug_assert!(s < self.stream_count);
        self.sizes[s]
    }

    /// Elements per stream.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }
}
