// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::id::MAX_TASK_GENERATIONS;
use mycelium_bitfield::{bitfield, enum_from_bits};

enum_from_bits! {
    /// Where a task is in its lifecycle, as recorded in the state tag.
    ///
    /// `Ready` and `Running` are implicit (a launched task that sits in a
    /// ready deque or on a worker); the tag only needs the transitions that
    /// other threads race against.
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum Phase<u8> {
        /// Between `define` and `launch`: the creator still owns the slot.
        Defined = 0b00,
        /// Launched; the scheduler owns the slot until the final work-count
        /// decrement.
        Launched = 0b01,
        /// The final decrement happened; permits are firing or have fired.
        Completed = 0b10,
    }
}

bitfield! {
    /// The packed per-slot state tag.
    ///
    /// The generation participates in every compare-exchange on the tag, so
    /// an operation racing against slot recycling loses cleanly instead of
    /// corrupting the next tenant.
    #[derive(Eq, PartialEq)]
    pub(crate) struct StateTag<u32> {
        pub(crate) const PHASE: Phase;
        /// Reserved for cooperative cancellation; never set by the core.
        pub(crate) const CANCELLED: bool;
        /// Matches the generation in the slot's current `TaskId`.
        pub(crate) const GENERATION = 5;
        /// Number of live entries in the slot's permit array.
        pub(crate) const PERMIT_COUNT = 4;
    }
}

// === impl StateTag ===

impl StateTag {
    /// Tag for a freshly (re)initialized slot handed to a creator.
    pub(crate) fn defined(generation: u32) -> Self {
        Self::new()
            .with(Self::PHASE, Phase::Defined)
            .with(Self::GENERATION, generation % MAX_TASK_GENERATIONS)
    }

    /// Tag for a dead slot waiting on the free ring; the generation is
    /// already bumped so every outstanding id for the old tenant is stale.
    pub(crate) fn dead(generation: u32) -> Self {
        Self::new()
            .with(Self::PHASE, Phase::Completed)
            .with(Self::GENERATION, generation % MAX_TASK_GENERATIONS)
    }

    #[inline]
    pub(crate) fn phase(self) -> Phase {
        self.get(Self::PHASE)
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.get(Self::GENERATION)
    }

    #[inline]
    pub(crate) fn permit_count(self) -> u32 {
        self.get(Self::PERMIT_COUNT)
    }
}
