// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::handle::{Handle, MAX_GENERATIONS, MAX_NAMESPACE, Namespace, StateCell};
use bitflags::bitflags;
use core::fmt;
use util::align_up;
use vmem::{Arena, MemError, MemoryLayout, MemoryView, page_size};

/// Slots per chunk.
pub const CHUNK_CAPACITY: usize = 1024;
/// Chunks per table.
pub const MAX_CHUNKS: usize = 1024;
/// Maximum number of simultaneously live handles in one table.
pub const MAX_OBJECTS: usize = CHUNK_CAPACITY * MAX_CHUNKS;

const WORD_BITS: usize = 64;
const WORD_COUNT: usize = MAX_CHUNKS / WORD_BITS;
/// The state and dense arrays, CHUNK_CAPACITY u32s each, at the tail of
/// every chunk block.
const META_BYTES: usize = 2 * CHUNK_CAPACITY * size_of::<u32>();

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TableFlags: u32 {
        /// The table only allocates identifiers; object data lives elsewhere.
        const IDENTITY = 1 << 0;
        /// The table stores per-object data streams inside its chunks.
        const STORAGE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TableError {
    InvalidArgument,
    /// Every chunk is committed and full.
    TableFull,
    /// Committing chunk memory failed.
    OutOfMemory,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::InvalidArgument => f.write_str("invalid argument"),
            TableError::TableFull => f.write_str("handle table is full"),
            TableError::OutOfMemory => f.write_str("chunk commit failed"),
        }
    }
}

impl core::error::Error for TableError {}

impl From<MemError> for TableError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::InvalidArgument => TableError::InvalidArgument,
            MemError::OutOfReserve | MemError::OsError(_) => TableError::OutOfMemory,
        }
    }
}

/// Configuration for [`HandleTable::create`].
#[derive(Debug, Clone)]
pub struct TableInit {
    pub namespace: Namespace,
    /// Chunks to commit eagerly at creation.
    pub initial_commit_chunks: u32,
    pub flags: TableFlags,
    /// Per-object data streams for [`TableFlags::STORAGE`] tables. Copied
    /// into the table.
    pub layout: MemoryLayout,
}

/// A chunked generational handle table.
///
/// All mutating operations require `&mut self`; concurrent use needs outer
/// synchronization (the task scheduler gets this for free by binding each
/// of its tables to one pool/thread).
///
/// Chunk block layout is `[data streams][state][dense]`. The dense array
/// packs the handles of the `count` live slots into its prefix; its tail
/// doubles as the free list of state indices, so no separate free-list
/// storage exists.
#[derive(Debug)]
pub struct HandleTable {
    arena: Arena,
    namespace: Namespace,
    flags: TableFlags,
    layout: MemoryLayout,
    /// `layout.size_for(CHUNK_CAPACITY)`, 0 for identity tables.
    data_bytes: usize,
    chunk_size: usize,
    /// Bit set per chunk that has committed memory.
    commit: [u64; WORD_COUNT],
    /// Bit set per committed chunk with at least one free slot.
    status: [u64; WORD_COUNT],
    counts: [u32; MAX_CHUNKS],
    commit_count: u32,
}

// === impl HandleTable ===

impl HandleTable {
    /// Reserve address space for the whole table and commit
    /// `init.initial_commit_chunks` chunks.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a namespace out of range, a storage table
    /// without a layout, or an initial commit beyond [`MAX_CHUNKS`];
    /// otherwise propagates reservation failures.
    pub fn create(init: &TableInit) -> Result<Self, TableError> {
        if u32::from(init.namespace.0) > MAX_NAMESPACE {
            return Err(TableError::InvalidArgument);
        }
        if init.initial_commit_chunks as usize > MAX_CHUNKS {
            return Err(TableError::InvalidArgument);
        }
        if init.flags.contains(TableFlags::STORAGE) && init.layout.is_empty() {
            return Err(TableError::InvalidArgument);
        }

        let data_bytes = if init.flags.contains(TableFlags::STORAGE) {
            init.layout.size_for(CHUNK_CAPACITY)
        } else {
            0
        };
        let chunk_size = align_up(data_bytes + META_BYTES, page_size());
        let arena = Arena::create(MAX_CHUNKS * chunk_size, 0)?;

        let mut table = Self {
            arena,
            namespace: init.namespace,
            flags: init.flags,
            layout: init.layout.clone(),
            data_bytes,
            chunk_size,
            commit: [0; WORD_COUNT],
            status: [0; WORD_COUNT],
            counts: [0; MAX_CHUNKS],
            commit_count: 0,
        };
        for _ in 0..init.initial_commit_chunks {
            table.commit_next_chunk()?;
        }
        Ok(table)
    }

    /// Allocate one fresh handle per element of `out`.
    ///
    /// Chunks are committed on demand, lowest index first. On failure no
    /// handle is leaked: every id created by this call is deleted again
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// [`TableError::TableFull`] once all chunks are committed and full,
    /// [`TableError::OutOfMemory`] when a chunk commit fails.
    pub fn create_ids(&mut self, out: &mut [Handle]) -> Result<(), TableError> {
        for i in 0..out.len() {
            let chunk = match self.first_available_chunk() {
                Some(chunk) => chunk,
                None => match self.commit_next_chunk() {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        self.delete_ids(&out[..i]);
                        return Err(err);
                    }
                },
            };
            out[i] = self.alloc_in_chunk(chunk);
        }
        Ok(())
    }

    /// Delete every id in `ids`.
    ///
    /// Stale, foreign-namespace and otherwise invalid handles are skipped
    /// silently; deleting the same handle twice is a no-op.
    pub fn delete_ids(&mut self, ids: &[Handle]) {
        for &id in ids {
            if !self.check_round_trip(id) {
                continue;
            }
            self.delete_one(id);
        }
    }

    /// Returns how many of `ids` pass the full round-trip validity check.
    #[must_use]
    pub fn validate_ids(&self, ids: &[Handle]) -> usize {
        ids.iter().filter(|&&id| self.check_round_trip(id)).count()
    }

    /// Full round-trip validity check for a single handle.
    #[must_use]
    pub fn validate(&self, id: Handle) -> bool {
        self.check_round_trip(id)
    }

    /// Resolve a live handle to `(chunk index, dense index, view)`.
    ///
    /// The dense index names the object in every data stream of the chunk's
    /// [`MemoryView`]. Returns `None` for invalid handles.
    #[must_use]
    pub fn resolve(&self, id: Handle) -> Option<(u32, u32, MemoryView)> {
        if !self.check_round_trip(id) {
            return None;
        }
        let chunk = id.chunk_index();
        let (state, _) = self.meta(chunk);
        let dense = StateCell::from_bits(state[id.slot_index() as usize]).dense_index();
        Some((chunk, dense, self.chunk_view(chunk)))
    }

    /// Invoke `cb` once per committed chunk with `(chunk index, live count,
    /// view)`. Iteration is driven by the commit bitmap, so uncommitted
    /// chunks cost nothing. Used for bulk teardown and polling.
    pub fn visit_chunks(&self, mut cb: impl FnMut(u32, u32, &MemoryView)) {
        for (w, &word) in self.commit.iter().enumerate() {
            let mut word = word;
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                let chunk = (w * WORD_BITS + bit) as u32;
                let view = self.chunk_view(chunk);
                cb(chunk, self.counts[chunk as usize], &view);
            }
        }
    }

    /// Delete every live handle while keeping committed chunks.
    ///
    /// Unlike deletion this also rewinds the generation counters, so a reset
    /// table hands out the same handle values a fresh table would.
    pub fn reset(&mut self) {
        for chunk in 0..self.commit_count {
            let chunk_us = chunk as usize;
            {
                let (state, dense) = self.meta_mut(chunk);
                for j in 0..CHUNK_CAPACITY {
                    state[j] = 0;
                    dense[j] = j as u32;
                }
            }
            self.counts[chunk_us] = 0;
            self.set_status(chunk);
        }
    }

    /// Number of live slots in `chunk`.
    #[must_use]
    pub fn chunk_item_count(&self, chunk: u32) -> u32 {
        self.counts[chunk as usize]
    }

    /// Number of committed chunks.
    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Whether the commit bit for `chunk` is set.
    #[must_use]
    pub fn chunk_committed(&self, chunk: u32) -> bool {
        self.commit[chunk as usize / WORD_BITS] & (1u64 << (chunk as usize % WORD_BITS)) != 0
    }

    /// Whether the status bit for `chunk` is set (chunk has room).
    #[must_use]
    pub fn chunk_has_room(&self, chunk: u32) -> bool {
        self.status[chunk as usize / WORD_BITS] & (1u64 << (chunk as usize % WORD_BITS)) != 0
    }

    /// Walk every committed chunk and check the table invariants: dense
    /// packing, sparse/dense round trips, generation agreement and
    /// status-bit consistency. Intended for tests and debugging; the cost
    /// is linear in committed capacity.
    #[must_use]
    pub fn verify(&self) -> bool {
        for chunk in 0..MAX_CHUNKS as u32 {
            if !self.chunk_committed(chunk) {
                continue;
            }
            let n = self.counts[chunk as usize] as usize;
            let (state, dense) = self.meta(chunk);

            // live prefix: handle -> state -> dense must round-trip
            for (j, &bits) in dense[..n].iter().enumerate() {
                let h = Handle::from_bits(bits);
                let cell = StateCell::from_bits(state[h.slot_index() as usize]);
                if !h.live() || !cell.live() {
                    return false;
                }
                if h.generation() != cell.generation() {
                    return false;
                }
                if cell.dense_index() as usize != j {
                    return false;
                }
            }
            // free tail: plain state indices, both sides dead
            for &bits in &dense[n..] {
                let h = Handle::from_bits(bits);
                let cell = StateCell::from_bits(state[bits as usize]);
                if h.live() || cell.live() {
                    return false;
                }
            }
            // status bit set <=> chunk has room
            if self.chunk_has_room(chunk) != (n < CHUNK_CAPACITY) {
                return false;
            }
        }
        true
    }

    fn first_available_chunk(&self) -> Option<u32> {
        for (w, &word) in self.status.iter().enumerate() {
            if word != 0 {
                return Some((w * WORD_BITS) as u32 + word.trailing_zeros());
            }
        }
        None
    }

    fn commit_next_chunk(&mut self) -> Result<u32, TableError> {
        if self.commit_count as usize == MAX_CHUNKS {
            return Err(TableError::TableFull);
        }
        let chunk = self.commit_count;
        let block = self.arena.alloc(self.chunk_size, 64)?;
        debug_assert_eq!(block.as_ptr(), self.chunk_base(chunk));

        {
            // fresh pages are zeroed, which is exactly a dead state array at
            // generation zero; only the dense free list needs writing.
            let (_, dense) = self.meta_mut(chunk);
            for (j, slot) in dense.iter_mut().enumerate() {
                *slot = j as u32;
            }
        }
        self.counts[chunk as usize] = 0;
        self.set_commit(chunk);
        self.set_status(chunk);
        self.commit_count += 1;
        tracing::trace!(chunk, "committed handle table chunk");
        Ok(chunk)
    }

    fn alloc_in_chunk(&mut self, chunk: u32) -> Handle {
        let namespace = self.namespace;
        let count = self.counts[chunk as usize] as usize;
        debug_assert!(count < CHUNK_CAPACITY);

        let handle;
        {
            let (state, dense) = self.meta_mut(chunk);
            let slot = dense[count];
            let generation = StateCell::from_bits(state[slot as usize]).generation();
            handle = Handle::pack(namespace, chunk, slot, generation);
            dense[count] = handle.bits();
            state[slot as usize] = StateCell::live_at(count as u32, generation).bits();
        }
        self.counts[chunk as usize] = (count + 1) as u32;
        if count + 1 == CHUNK_CAPACITY {
            self.clear_status(chunk);
        }
        handle
    }

    fn delete_one(&mut self, id: Handle) {
        let chunk = id.chunk_index();
        let slot = id.slot_index() as usize;
        let count = self.counts[chunk as usize] as usize;
        let move_data = self.flags.contains(TableFlags::STORAGE);
        let view = self.chunk_view(chunk);

        {
            let (state, dense) = self.meta_mut(chunk);
            let j = StateCell::from_bits(state[slot]).dense_index() as usize;
            let k = count - 1;
            if j != k {
                // swap-remove: the last live entry fills the hole, its state
                // cell is repointed, and for storage tables the object data
                // moves with it so the dense prefix stays packed.
                let moved = dense[k];
                dense[j] = moved;
                let moved_slot = Handle::from_bits(moved).slot_index() as usize;
                state[moved_slot] = StateCell::from_bits(state[moved_slot])
                    .with(StateCell::DENSE, j as u32)
                    .bits();
                if move_data {
                    for s in 0..view.stream_count() {
                        // Safety: both elements lie in this chunk's committed
                        // data block; src and dst are distinct because j != k.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                view.stream_at(s, k),
                                view.stream_at(s, j),
                                view.stream_size(s),
                            );
                        }
                    }
                }
            }
            dense[k] = slot as u32;
            let generation =
                (StateCell::from_bits(state[slot]).generation() + 1) % MAX_GENERATIONS;
            state[slot] = StateCell::dead(generation).bits();
        }
        self.counts[chunk as usize] = (count - 1) as u32;
        self.set_status(chunk);
    }

    fn check_round_trip(&self, id: Handle) -> bool {
        if !id.live() || id.namespace() != u32::from(self.namespace.0) {
            return false;
        }
        let chunk = id.chunk_index();
        if !self.chunk_committed(chunk) {
            return false;
        }
        let (state, dense) = self.meta(chunk);
        let cell = StateCell::from_bits(state[id.slot_index() as usize]);
        if !cell.live() || cell.generation() != id.generation() {
            return false;
        }
        let j = cell.dense_index() as usize;
        j < self.counts[chunk as usize] as usize && dense[j] == id.bits()
    }

    fn chunk_base(&self, chunk: u32) -> *mut u8 {
        debug_assert!((chunk as usize) < MAX_CHUNKS);
        // Safety: chunk * chunk_size is within the reservation.
        unsafe { self.arena.base().as_ptr().add(chunk as usize * self.chunk_size) }
    }

    fn chunk_view(&self, chunk: u32) -> MemoryView {
        // Safety: chunk_base is derived from the arena base, never null.
        let base = unsafe { util::non_null(self.chunk_base(chunk)) };
        self.layout.view(base, CHUNK_CAPACITY)
    }

    /// The state and dense arrays of a committed chunk.
    fn meta(&self, chunk: u32) -> (&[u32], &[u32]) {
        let base = self.chunk_base(chunk);
        // Safety: the chunk is committed; the two arrays are disjoint
        // CHUNK_CAPACITY-long u32 arrays at the tail of the chunk block.
        unsafe {
            let state = core::slice::from_raw_parts(
                base.add(self.chunk_size - META_BYTES).cast::<u32>(),
                CHUNK_CAPACITY,
            );
            let dense = core::slice::from_raw_parts(
                base.add(self.chunk_size - META_BYTES / 2).cast::<u32>(),
                CHUNK_CAPACITY,
            );
            (state, dense)
        }
    }

    fn meta_mut(&mut self, chunk: u32) -> (&mut [u32], &mut [u32]) {
        let base = self.chunk_base(chunk);
        // Safety: as in `meta`, plus `&mut self` guarantees exclusivity.
        unsafe {
            let state = core::slice::from_raw_parts_mut(
                base.add(self.chunk_size - META_BYTES).cast::<u32>(),
                CHUNK_CAPACITY,
            );
            let dense = core::slice::from_raw_parts_mut(
                base.add(self.chunk_size - META_BYTES / 2).cast::<u32>(),
                CHUNK_CAPACITY,
            );
            (state, dense)
        }
    }

    fn set_commit(&mut self, chunk: u32) {
        self.commit[chunk as usize / WORD_BITS] |= 1u64 << (chunk as usize % WORD_BITS);
    }

    fn set_status(&mut self, chunk: u32) {
        self.status[chunk as usize / WORD_BITS] |= 1u64 << (chunk as usize % WORD_BITS);
    }

    fn clear_status(&mut self, chunk: u32) {
        self.status[chunk as usize / WORD_BITS] &= !(1u64 << (chunk as usize % WORD_BITS));
    }
}
