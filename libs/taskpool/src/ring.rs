// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded index rings over raw pool memory.
//!
//! Both ring types view a caller-provided block of zeroed cells; the pool
//! sizes every ring to its slot capacity, so neither can overflow: at most
//! `capacity` indices are ever in flight.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering, fence};
use util::CachePadded;

/// A power-of-two array of `AtomicU32` cells in borrowed memory.
pub(crate) struct Ring {
    cells: NonNull<AtomicU32>,
    mask: u64,
}

// Safety: the cells are atomics; the memory is owned by the pool region
// which outlives the ring.
unsafe impl Send for Ring {}
// Safety: see above.
unsafe impl Sync for Ring {}

// === impl Ring ===

impl Ring {
    /// # Safety
    ///
    /// `storage` must point to `capacity * 4` bytes of zeroed, 4-aligned
    /// memory that stays valid and pinned for the ring's lifetime.
    /// `capacity` must be a power of two.
    pub(crate) unsafe fn from_raw(storage: *mut u8, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert_eq!(storage as usize % align_of::<AtomicU32>(), 0);
        Self {
            // Safety: ensured by caller.
            cells: unsafe { util::non_null(storage.cast::<AtomicU32>()) },
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    fn cell(&self, pos: u64) -> &AtomicU32 {
        // Safety: pos is masked into the cell array.
        unsafe { self.cells.add((pos & self.mask) as usize).as_ref() }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.mask + 1
    }
}

/// Multi-producer, single-consumer ring of free slot indices.
///
/// Any thread may [`push`](FreeRing::push) (a completer returning a slot);
/// only the pool's bound thread may [`pop`](FreeRing::pop). Cells hold
/// `index + 1` so the zeroed state reads as empty.
pub(crate) struct FreeRing {
    ring: Ring,
    /// Consumer cursor; owner thread only.
    alloc_pos: CachePadded<AtomicU64>,
    /// Producer cursor; bumped by any thread.
    free_pos: CachePadded<AtomicU64>,
}

// === impl FreeRing ===

impl FreeRing {
    /// # Safety
    ///
    /// See [`Ring::from_raw`].
    pub(crate) unsafe fn from_raw(storage: *mut u8, capacity: usize) -> Self {
        Self {
            // Safety: ensured by caller.
            ring: unsafe { Ring::from_raw(storage, capacity) },
            alloc_pos: CachePadded::new(AtomicU64::new(0)),
            free_pos: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Return `index` to the ring. Callable from any thread.
    pub(crate) fn push(&self, index: u32) {
        let pos = self.free_pos.fetch_add(1, Ordering::Relaxed);
        let cell = self.ring.cell(pos);
        debug_assert_eq!(cell.load(Ordering::Relaxed), 0, "free ring overflow");
        cell.store(index + 1, Ordering::Release);
    }

    /// Take the oldest free index, if any. Owner thread only.
    pub(crate) fn pop(&self) -> Option<u32> {
        let head = self.alloc_pos.load(Ordering::Relaxed);
        if head == self.free_pos.load(Ordering::Acquire) {
            return None;
        }
        let cell = self.ring.cell(head);
        // the producer bumps free_pos before storing the value; wait for the
        // store to land.
        loop {
            let value = cell.load(Ordering::Acquire);
            if value != 0 {
                cell.store(0, Ordering::Relaxed);
                self.alloc_pos.store(head + 1, Ordering::Relaxed);
                return Some(value - 1);
            }
            core::hint::spin_loop();
        }
    }

}

/// Result of a steal attempt on a [`ReadyDeque`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal {
    /// Nothing to steal.
    Empty,
    /// Lost a race against another consumer; try a different victim.
    Abort,
    Stolen(u32),
}

/// Bounded single-producer multi-consumer work-stealing deque of task id
/// bits: the classical Chase–Lev deque over a fixed-size ring.
///
/// The owner pushes and takes at the private end; thieves compete at the
/// public end with a compare-exchange.
pub(crate) struct ReadyDeque {
    ring: Ring,
    /// Push/take end; mutated only by the owning thread.
    private_pos: CachePadded<AtomicI64>,
    /// Steal end; advanced by any thread via compare-exchange.
    public_pos: CachePadded<AtomicI64>,
}

// === impl ReadyDeque ===

impl ReadyDeque {
    /// # Safety
    ///
    /// See [`Ring::from_raw`].
    pub(crate) unsafe fn from_raw(storage: *mut u8, capacity: usize) -> Self {
        Self {
            // Safety: ensured by caller.
            ring: unsafe { Ring::from_raw(storage, capacity) },
            private_pos: CachePadded::new(AtomicI64::new(0)),
            public_pos: CachePadded::new(AtomicI64::new(0)),
        }
    }

    /// Publish `id` at the private end. Owner thread only.
    pub(crate) fn push(&self, id: u32) {
        let b = self.private_pos.load(Ordering::Relaxed);
        debug_assert!(
            b - self.public_pos.load(Ordering::Relaxed) < self.ring.capacity() as i64,
            "ready deque overflow"
        );
        self.ring.cell(b as u64).store(id, Ordering::Relaxed);
        self.private_pos.store(b + 1, Ordering::Release);
    }

    /// Pop the most recently pushed id. Owner thread only.
    pub(crate) fn take(&self) -> Option<u32> {
        let b = self.private_pos.load(Ordering::Relaxed) - 1;
        // speculatively claim the last element, then re-check against the
        // public end.
        self.private_pos.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.public_pos.load(Ordering::Relaxed);

        if t > b {
            // deque was empty; restore.
            self.private_pos.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let id = self.ring.cell(b as u64).load(Ordering::Relaxed);
        if t == b {
            // last element: race thieves for it.
            let won = self
                .public_pos
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.private_pos.store(b + 1, Ordering::Relaxed);
            return won.then_some(id);
        }
        Some(id)
    }

    /// Try to steal the oldest id from the public end. Any thread.
    pub(crate) fn steal(&self) -> Steal {
        let t = self.public_pos.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.private_pos.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }
        let id = self.ring.cell(t as u64).load(Ordering::Relaxed);
        if self
            .public_pos
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Stolen(id)
        } else {
            Steal::Abort
        }
    }

    /// Whether a consumer could currently observe work. Approximate.
    pub(crate) fn has_work(&self) -> bool {
        self.public_pos.load(Ordering::Acquire) < self.private_pos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use vmem::VirtualRegion;

    struct Backing {
        _region: VirtualRegion,
        ptr: *mut u8,
    }

    // Safety: the pointer targets the region owned by the same value; tests
    // only touch it through the rings' atomics.
    unsafe impl Send for Backing {}
    // Safety: see above.
    unsafe impl Sync for Backing {}

    fn backing(capacity: usize) -> Backing {
        let region = VirtualRegion::reserve(capacity * 4).unwrap();
        region.commit(0, capacity * 4).unwrap();
        let ptr = region.as_ptr(0);
        Backing {
            _region: region,
            ptr,
        }
    }

    #[test]
    fn free_ring_round_trips_in_order() {
        let b = backing(64);
        // Safety: committed, zeroed, 4-aligned backing of 64 cells.
        let ring = unsafe { FreeRing::from_raw(b.ptr, 64) };

        for i in 0..64 {
            ring.push(i);
        }
        for i in 0..64 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn free_ring_many_producers_one_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1024;
        const CAP: usize = 8192;

        let b = backing(CAP);
        // Safety: committed, zeroed backing of CAP cells; the Arc keeps the
        // region alive until every thread is done.
        let ring = Arc::new((unsafe { FreeRing::from_raw(b.ptr, CAP) }, b));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        ring.0.push((p * PER_PRODUCER + i) as u32);
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut popped = 0;
        while popped < PRODUCERS * PER_PRODUCER {
            if let Some(v) = ring.0.pop() {
                assert!(!seen[v as usize], "duplicate index {v}");
                seen[v as usize] = true;
                popped += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn deque_owner_takes_lifo() {
        let b = backing(16);
        // Safety: committed, zeroed backing of 16 cells.
        let deque = unsafe { ReadyDeque::from_raw(b.ptr, 16) };

        deque.push(1);
        deque.push(2);
        deque.push(3);
        assert_eq!(deque.take(), Some(3));
        assert_eq!(deque.take(), Some(2));
        assert_eq!(deque.take(), Some(1));
        assert_eq!(deque.take(), None);
    }

    #[test]
    fn deque_thieves_steal_fifo() {
        let b = backing(16);
        // Safety: committed, zeroed backing of 16 cells.
        let deque = unsafe { ReadyDeque::from_raw(b.ptr, 16) };

        deque.push(1);
        deque.push(2);
        assert_eq!(deque.steal(), Steal::Stolen(1));
        assert_eq!(deque.steal(), Steal::Stolen(2));
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn deque_contested_last_element_goes_to_exactly_one() {
        // repeat a small owner/thief race many times: the single element
        // must go to exactly one side, never both, never neither.
        for _ in 0..2000 {
            let b = backing(4);
            // Safety: committed, zeroed backing of 4 cells.
            let deque = Arc::new((unsafe { ReadyDeque::from_raw(b.ptr, 4) }, b));
            deque.0.push(42);

            let thief = {
                let deque = Arc::clone(&deque);
                std::thread::spawn(move || matches!(deque.0.steal(), Steal::Stolen(42)))
            };
            let owner_got = deque.0.take() == Some(42);
            let thief_got = thief.join().unwrap();

            assert!(
                owner_got ^ thief_got,
                "owner={owner_got} thief={thief_got}"
            );
        }
    }

    #[test]
    fn deque_stealing_under_load_loses_nothing() {
        const TASKS: u32 = 10_000;
        const THIEVES: usize = 3;

        let b = backing(16384);
        // Safety: committed, zeroed backing of 16384 cells.
        let deque = Arc::new((unsafe { ReadyDeque::from_raw(b.ptr, 16384) }, b));
        let stolen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = Arc::clone(&deque);
                let stolen = Arc::clone(&stolen);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut count = 0usize;
                    loop {
                        match deque.0.steal() {
                            Steal::Stolen(_) => count += 1,
                            Steal::Abort => {}
                            Steal::Empty => {
                                if done.load(Ordering::Acquire) && !deque.0.has_work() {
                                    break;
                                }
                            }
                        }
                    }
                    stolen.fetch_add(count, Ordering::AcqRel);
                })
            })
            .collect();

        let mut taken = 0usize;
        for i in 0..TASKS {
            deque.0.push(i);
            if i % 3 == 0 && deque.0.take().is_some() {
                taken += 1;
            }
        }
        while deque.0.take().is_some() {
            taken += 1;
        }
        done.store(true, Ordering::Release);

        for t in thieves {
            t.join().unwrap();
        }
        assert_eq!(taken + stolen.load(Ordering::Acquire), TASKS as usize);
    }
}
