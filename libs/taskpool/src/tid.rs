// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread id 0 is reserved to mean "unbound".
pub(crate) const UNBOUND: u64 = 0;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static CURRENT_TID: Cell<u64> = const { Cell::new(UNBOUND) };
}

/// A small, never-reused numeric id for the calling thread, assigned lazily
/// on first use.
pub(crate) fn current() -> u64 {
    CURRENT_TID.with(|cell| {
        let tid = cell.get();
        if tid != UNBOUND {
            return tid;
        }
        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        cell.set(tid);
        tid
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_within_a_thread_distinct_across_threads() {
        let mine = current();
        assert_eq!(current(), mine);

        let other = std::thread::spawn(current).join().unwrap();
        assert_ne!(mine, other);
        assert_ne!(other, UNBOUND);
    }
}
