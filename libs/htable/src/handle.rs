// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use mycelium_bitfield::bitfield;

/// Highest representable namespace value (7 bits).
pub const MAX_NAMESPACE: u32 = (1 << 7) - 1;

/// Number of distinct generation values before a slot's counter wraps.
pub const MAX_GENERATIONS: u32 = 1 << 4;

/// Tag distinguishing tables of different kinds. Embedding the namespace in
/// every handle prevents a handle from one table from resolving against
/// another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace(pub u8);

bitfield! {
    /// A packed 32-bit value naming one object in a [`HandleTable`].
    ///
    /// Bit layout, LSB to MSB: live flag, namespace, chunk index, slot
    /// (state) index within the chunk, generation counter. The all-zero
    /// value is never a live handle.
    ///
    /// [`HandleTable`]: crate::HandleTable
    #[derive(Eq, PartialEq)]
    pub struct Handle<u32> {
        /// Set while the handle names an allocated slot; clear for
        /// tombstones and sentinels.
        pub const LIVE: bool;
        /// The owning table's namespace tag.
        pub const NAMESPACE = 7;
        /// Which chunk of the table holds the slot.
        pub const CHUNK = 10;
        /// The slot (state cell) index inside the chunk.
        pub const SLOT = 10;
        /// Incremented each time the slot is deleted; wraps mod 16.
        pub const GENERATION = 4;
    }
}

bitfield! {
    /// One entry of a chunk's sparse state array: maps a slot index back to
    /// its dense position and carries the authoritative liveness/generation.
    #[derive(Eq, PartialEq)]
    pub struct StateCell<u32> {
        /// Whether the slot is currently allocated.
        pub const LIVE: bool;
        /// Position of the slot's handle in the chunk's dense array.
        pub const DENSE = 10;
        /// Current generation of the slot. Survives deletion so the next
        /// allocation hands out a fresh handle.
        pub const GENERATION = 4;
    }
}

// === impl Handle ===

impl Handle {
    /// The canonical invalid handle.
    pub const NONE: Self = Self::from_bits(0);

    /// Pack a live handle from its components. The generation is reduced
    /// into the four-bit field.
    #[must_use]
    pub fn pack(namespace: Namespace, chunk: u32, slot: u32, generation: u32) -> Self {
        Self::new()
            .with(Self::LIVE, true)
            .with(Self::NAMESPACE, u32::from(namespace.0))
            .with(Self::CHUNK, chunk)
            .with(Self::SLOT, slot)
            .with(Self::GENERATION, generation % MAX_GENERATIONS)
    }

    #[inline]
    #[must_use]
    pub fn live(self) -> bool {
        self.get(Self::LIVE)
    }

    #[inline]
    #[must_use]
    pub fn namespace(self) -> u32 {
        self.get(Self::NAMESPACE)
    }

    #[inline]
    #[must_use]
    pub fn chunk_index(self) -> u32 {
        self.get(Self::CHUNK)
    }

    #[inline]
    #[must_use]
    pub fn slot_index(self) -> u32 {
        self.get(Self::SLOT)
    }

    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.get(Self::GENERATION)
    }
}

// === impl StateCell ===

impl StateCell {
    /// Pack a live state cell pointing at dense position `dense`.
    #[must_use]
    pub(crate) fn live_at(dense: u32, generation: u32) -> Self {
        Self::new()
            .with(Self::LIVE, true)
            .with(Self::DENSE, dense)
            .with(Self::GENERATION, generation)
    }

    /// Pack a dead state cell carrying `generation` forward.
    #[must_use]
    pub(crate) fn dead(generation: u32) -> Self {
        Self::new().with(Self::GENERATION, generation)
    }

    #[inline]
    #[must_use]
    pub fn live(self) -> bool {
        self.get(Self::LIVE)
    }

    #[inline]
    #[must_use]
    pub fn dense_index(self) -> u32 {
        self.get(Self::DENSE)
    }

    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.get(Self::GENERATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips_components() {
        let h = Handle::pack(Namespace(3), 17, 1001, 9);
        assert!(h.live());
        assert_eq!(h.namespace(), 3);
        assert_eq!(h.chunk_index(), 17);
        assert_eq!(h.slot_index(), 1001);
        assert_eq!(h.generation(), 9);
    }

    #[test]
    fn none_is_dead() {
        assert!(!Handle::NONE.live());
        assert_eq!(Handle::NONE.bits(), 0);
    }

    #[test]
    fn generation_wraps_in_four_bits() {
        let h = Handle::pack(Namespace(0), 0, 0, MAX_GENERATIONS - 1);
        assert_eq!(h.generation(), 15);
        // packing a wrapped generation keeps only the low four bits
        let wrapped = Handle::pack(Namespace(0), 0, 0, MAX_GENERATIONS % MAX_GENERATIONS);
        assert_eq!(wrapped.generation(), 0);
    }
}
