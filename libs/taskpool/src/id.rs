// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use mycelium_bitfield::bitfield;

/// Number of distinct task generations before a slot's counter wraps.
pub(crate) const MAX_TASK_GENERATIONS: u32 = 1 << 5;

/// Highest pool index addressable by a task id.
pub(crate) const MAX_POOLS: usize = 1 << 10;

bitfield! {
    /// A packed 32-bit value naming one task slot in one pool.
    ///
    /// The structure is inherited from the handle-table discipline: a
    /// validity bit, an owner (the pool index standing in for a chunk), a
    /// slot index and a generation counter that detects reuse. The all-zero
    /// value is [`TaskId::NONE`].
    #[derive(Eq, PartialEq, Hash)]
    pub struct TaskId<u32> {
        /// Clear only for `NONE` and tombstones.
        pub const VALID: bool;
        /// Index of the owning pool in its storage.
        pub const POOL = 10;
        /// Task slot index inside the owning pool.
        pub const SLOT = 16;
        /// Incremented each time the slot is recycled; wraps mod 32.
        pub const GENERATION = 5;
    }
}

bitfield! {
    /// A packed reference to one permits list: owning pool plus permit slot.
    ///
    /// Stored in producer tasks' permit arrays and in a dependent task's
    /// launch gate. The all-zero value means "no list".
    #[derive(Eq, PartialEq)]
    pub(crate) struct PermitRef<u32> {
        pub(crate) const VALID: bool;
        pub(crate) const POOL = 10;
        pub(crate) const SLOT = 16;
    }
}

// === impl TaskId ===

impl TaskId {
    /// The canonical invalid id, used as list terminator and "no parent".
    pub const NONE: Self = Self::from_bits(0);

    #[must_use]
    pub(crate) fn pack(pool: u32, slot: u32, generation: u32) -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::POOL, pool)
            .with(Self::SLOT, slot)
            .with(Self::GENERATION, generation % MAX_TASK_GENERATIONS)
    }

    /// Whether this id can possibly name a task (stale ids are also
    /// "valid"; only full resolution against the owning pool can tell).
    #[inline]
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.get(Self::VALID)
    }

    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        self.bits() == 0
    }

    #[inline]
    #[must_use]
    pub fn pool_index(self) -> u32 {
        self.get(Self::POOL)
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

// === impl PermitRef ===

impl PermitRef {
    pub(crate) const NONE: Self = Self::from_bits(0);

    #[must_use]
    pub(crate) fn pack(pool: u32, slot: u32) -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::POOL, pool)
            .with(Self::SLOT, slot)
    }

    #[inline]
    pub(crate) fn is_none(self) -> bool {
        self.bits() == 0
    }

    #[inline]
    pub(crate) fn pool_index(self) -> u32 {
        self.get(Self::POOL)
    }

    #[inline]
    pub(crate) fn slot_index(self) -> u32 {
        self.get(Self::SLOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips() {
        let id = TaskId::pack(512, 65535, 31);
        assert!(id.is_valid());
        assert_eq!(id.pool_index(), 512);
        assert_eq!(id.slot_index(), 65535);
        assert_eq!(id.generation(), 31);
    }

    #[test]
    fn none_is_invalid_and_zero() {
        assert!(!TaskId::NONE.is_valid());
        assert!(TaskId::NONE.is_none());
        assert_eq!(TaskId::NONE.bits(), 0);
        assert!(PermitRef::NONE.is_none());
    }

    #[test]
    fn generation_wraps_in_five_bits() {
        let id = TaskId::pack(0, 0, MAX_TASK_GENERATIONS - 1);
        assert_eq!(id.generation(), 31);
        let wrapped = TaskId::pack(0, 0, MAX_TASK_GENERATIONS);
        assert_eq!(wrapped.generation(), 0);
    }
}
