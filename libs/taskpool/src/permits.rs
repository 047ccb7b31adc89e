// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::id::TaskId;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use static_assertions::{assert_eq_size, const_assert_eq};

/// Dependent tasks one permits list can carry; the list terminates at the
/// first `TaskId::NONE` entry.
pub(crate) const PERMIT_TASK_CAPACITY: usize = 30;

/// A set of tasks that become runnable when the same set of producers has
/// all completed.
///
/// `wait_count` is the only field mutated after the list is attached; every
/// producer holds exactly one reference, and the list is consumed exactly
/// once, by whichever decrement drives the count to zero. The extra *launch
/// hold* (+1 per dependent) keeps the list from firing before its
/// dependents are launched.
#[repr(C, align(64))]
pub(crate) struct PermitsList {
    /// Producers (plus launch holds) remaining before the list fires.
    pub(crate) wait_count: AtomicI32,
    /// Index of the pool whose permit arena owns this list.
    pub(crate) owner_pool: AtomicU32,
    pub(crate) task_list: [AtomicU32; PERMIT_TASK_CAPACITY],
}

assert_eq_size!(PermitsList, [u8; 128]);
const_assert_eq!(align_of::<PermitsList>(), 64);

// Safety: all fields are atomics.
unsafe impl Send for PermitsList {}
// Safety: all fields are atomics.
unsafe impl Sync for PermitsList {}

// === impl PermitsList ===

impl PermitsList {
    /// Value for freshly committed permit memory.
    pub(crate) fn new_empty() -> Self {
        Self {
            wait_count: AtomicI32::new(0),
            owner_pool: AtomicU32::new(0),
            task_list: [const { AtomicU32::new(0) }; PERMIT_TASK_CAPACITY],
        }
    }

    /// Reinitialize a list popped from the free ring: `wait_count` starts at
    /// `wait`, the task list holds exactly `first`.
    ///
    /// Must only be called by the pool owner while the list is off every
    /// shared structure.
    pub(crate) fn reinit(&self, owner_pool: u32, wait: i32, first: TaskId) {
        self.owner_pool.store(owner_pool, Ordering::Relaxed);
        self.task_list[0].store(first.bits(), Ordering::Relaxed);
        self.task_list[1].store(TaskId::NONE.bits(), Ordering::Relaxed);
        // the count store publishes the list; attach happens after this.
        self.wait_count.store(wait, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_two_cache_lines() {
        assert_eq!(size_of::<PermitsList>(), 128);
        assert_eq!(align_of::<PermitsList>(), 64);
    }

    #[test]
    fn reinit_terminates_the_task_list() {
        let list = PermitsList::new_empty();
        let id = TaskId::pack(1, 42, 0);
        list.reinit(7, 3, id);

        assert_eq!(list.wait_count.load(Ordering::Acquire), 3);
        assert_eq!(list.owner_pool.load(Ordering::Relaxed), 7);
        assert_eq!(list.task_list[0].load(Ordering::Relaxed), id.bits());
        assert_eq!(list.task_list[1].load(Ordering::Relaxed), 0);
    }
}
