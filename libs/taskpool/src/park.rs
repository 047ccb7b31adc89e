// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Condvar, Mutex};

/// Entries in the recently-published-pool ring.
pub(crate) const STEAL_SET_SIZE: usize = 8;

/// The suspend/resume primitive a worker thread blocks on.
pub(crate) trait Park {
    fn park(&self);
    fn unpark(&self);
}

/// A binary semaphore built from a mutex and a condvar: an `unpark` that
/// arrives before the matching `park` is not lost.
#[derive(Debug)]
pub(crate) struct StdPark {
    permit: Mutex<bool>,
    cv: Condvar,
}

// === impl StdPark ===

impl StdPark {
    pub(crate) fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Park for StdPark {
    fn park(&self) {
        let mut permit = self.permit.lock().unwrap();
        while !*permit {
            permit = self.cv.wait(permit).unwrap();
        }
        *permit = false;
    }

    fn unpark(&self) {
        let mut permit = self.permit.lock().unwrap();
        *permit = true;
        self.cv.notify_one();
    }
}

/// Shared handle to one thread's park primitive.
#[derive(Debug)]
pub(crate) struct Parker<P>(Arc<P>);

/// A clonable token that can wake the [`Parker`] it was created from.
#[derive(Debug)]
pub(crate) struct UnparkToken<P>(Parker<P>);

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P> Clone for UnparkToken<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

// === impl Parker ===

impl<P: Park> Parker<P> {
    pub(crate) fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    /// Convert this [`Parker`] into an [`UnparkToken`] which can be used to
    /// wake up the owning thread.
    #[inline]
    pub(crate) fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }

    fn same_target(&self, token: &UnparkToken<P>) -> bool {
        Arc::ptr_eq(&self.0, &token.0.0)
    }
}

// === impl UnparkToken ===

impl<P: Park> UnparkToken<P> {
    #[inline]
    pub(crate) fn unpark(&self) {
        self.0.0.unpark();
    }
}

struct ParkedWorker<P> {
    /// Pool index of the parked worker, so wakers can leave a steal hint.
    pool_index: u32,
    token: UnparkToken<P>,
}

/// Scheduler-wide parked-worker state plus the publish side of the
/// worker-wakeup handshake.
///
/// Publishers record their pool index in a small ring and bump the ready
/// event count *before* signalling a semaphore; a parking worker registers
/// itself *before* its final re-check of peer queues. Whichever side loses
/// the race still observes the other, so no wakeup is lost.
pub(crate) struct ParkingLot<P> {
    /// Number of currently parked (registered) workers.
    num_parked: AtomicUsize,
    parked: Mutex<Vec<ParkedWorker<P>>>,
    /// Monotonic count of steal notifications ever published.
    ready_events: AtomicU64,
    /// The last [`STEAL_SET_SIZE`] pool indices (plus one; zero is empty)
    /// that published work.
    steal_set: [AtomicU32; STEAL_SET_SIZE],
}

// === impl ParkingLot ===

impl<P: Park> ParkingLot<P> {
    pub(crate) fn new() -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
            ready_events: AtomicU64::new(0),
            steal_set: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::SeqCst)
    }

    pub(crate) fn ready_events(&self) -> u64 {
        self.ready_events.load(Ordering::Acquire)
    }

    /// Record `pool_index` as having work available to steal.
    pub(crate) fn record_publisher(&self, pool_index: u32) {
        let n = self.ready_events.fetch_add(1, Ordering::AcqRel);
        self.steal_set[(n as usize) % STEAL_SET_SIZE].store(pool_index + 1, Ordering::Release);
    }

    /// A recently publishing pool other than `avoid`, if any.
    pub(crate) fn publisher_hint(&self, avoid: u32) -> Option<u32> {
        for slot in &self.steal_set {
            let v = slot.load(Ordering::Acquire);
            if v != 0 && v - 1 != avoid {
                return Some(v - 1);
            }
        }
        None
    }

    /// Park the calling worker until a waker signals it.
    ///
    /// `has_work` is evaluated after registration (the Dekker-style
    /// re-check): when it reports visible work the worker withdraws and
    /// returns immediately instead of sleeping.
    pub(crate) fn park(&self, pool_index: u32, parker: &Parker<P>, has_work: impl Fn() -> bool) {
        self.num_parked.fetch_add(1, Ordering::SeqCst);
        self.parked.lock().unwrap().push(ParkedWorker {
            pool_index,
            token: parker.clone().into_unpark(),
        });

        if has_work() {
            // withdraw: a publisher raced us. If our token is already gone a
            // waker popped it and the signal is in flight; consume it so the
            // permit does not linger into the next park.
            if !self.remove(parker) {
                parker.park();
            }
            self.num_parked.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        parker.park();
        // woken by unpark_all (which signals without popping) the token may
        // still be queued.
        self.remove(parker);
        self.num_parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Pop one parked worker for waking. The caller stores a wakeup hint and
    /// then signals the returned token.
    pub(crate) fn pop(&self) -> Option<(u32, UnparkToken<P>)> {
        let mut parked = self.parked.lock().unwrap();
        parked.pop().map(|w| (w.pool_index, w.token))
    }

    /// Wake every parked worker, returning how many were signalled.
    pub(crate) fn unpark_all(&self) -> usize {
        let tokens: Vec<_> = {
            let parked = self.parked.lock().unwrap();
            parked.iter().map(|w| w.token.clone()).collect()
        };
        for token in &tokens {
            token.unpark();
        }
        tokens.len()
    }

    fn remove(&self, parker: &Parker<P>) -> bool {
        let mut parked = self.parked.lock().unwrap();
        let before = parked.len();
        parked.retain(|w| !parker.same_target(&w.token));
        parked.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::atomic::AtomicBool;
    use crate::loom::thread;

    #[test]
    fn parking_basically_works() {
        // thread A parks itself after sending an unpark token to thread B;
        // thread B wakes it through the token.
        loom::model(|| {
            let flag = Arc::new(AtomicBool::new(false));
            let (tx, rx) = std::sync::mpsc::channel();

            let a = {
                let flag = Arc::clone(&flag);
                thread::spawn(move || {
                    let parker = Parker::new(StdPark::new());
                    tx.send(parker.clone().into_unpark()).unwrap();
                    parker.park();
                    flag.store(true, Ordering::Release);
                })
            };
            let b = thread::spawn(move || {
                rx.recv().unwrap().unpark();
            });

            a.join().unwrap();
            b.join().unwrap();
            assert!(flag.load(Ordering::Acquire));
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new(StdPark::new());
        let token = parker.clone().into_unpark();
        token.unpark();
        // the stored permit makes this return immediately
        parker.park();
    }

    #[cfg(not(loom))]
    #[test]
    fn lot_recheck_withdraws_instead_of_sleeping() {
        let lot: ParkingLot<StdPark> = ParkingLot::new();
        let parker = Parker::new(StdPark::new());

        // has_work reports visible work: park must return without a signal
        lot.park(0, &parker, || true);
        assert_eq!(lot.num_parked(), 0);
        assert!(lot.pop().is_none());
    }

    #[cfg(not(loom))]
    #[test]
    fn lot_pop_then_signal_wakes_the_worker() {
        let lot: std::sync::Arc<ParkingLot<StdPark>> = std::sync::Arc::new(ParkingLot::new());

        let worker = {
            let lot = std::sync::Arc::clone(&lot);
            std::thread::spawn(move || {
                let parker = Parker::new(StdPark::new());
                lot.park(3, &parker, || false);
            })
        };

        // wait until the worker registered itself
        while lot.num_parked() == 0 {
            std::thread::yield_now();
        }
        let (pool_index, token) = lot.pop().unwrap();
        assert_eq!(pool_index, 3);
        token.unpark();
        worker.join().unwrap();
        assert_eq!(lot.num_parked(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn publisher_ring_keeps_recent_pools() {
        let lot: ParkingLot<StdPark> = ParkingLot::new();
        assert_eq!(lot.publisher_hint(0), None);

        lot.record_publisher(5);
        assert_eq!(lot.publisher_hint(0), Some(5));
        // the publisher itself is skipped
        assert_eq!(lot.publisher_hint(5), None);

        lot.record_publisher(9);
        assert_eq!(lot.publisher_hint(5), Some(9));
        assert_eq!(lot.ready_events(), 2);
    }
}
