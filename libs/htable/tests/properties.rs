// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Property harness for the handle table: after every operation of a random
//! create/delete/validate sequence the full table invariants must hold and
//! every handle the model considers live (dead) must validate (fail).

use htable::{Handle, HandleTable, MAX_GENERATIONS, Namespace, TableFlags, TableInit};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    /// Allocate `n` fresh handles.
    Create(usize),
    /// Delete the live handle at (index % live count).
    DeleteLive(usize),
    /// Re-delete an already deleted handle (must be a no-op).
    DeleteStale(usize),
    Reset,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            8 => (1usize..64).prop_map(Op::Create),
            8 => any::<usize>().prop_map(Op::DeleteLive),
            2 => any::<usize>().prop_map(Op::DeleteStale),
            1 => Just(Op::Reset),
        ],
        1..80,
    )
}

fn new_table() -> HandleTable {
    HandleTable::create(&TableInit {
        namespace: Namespace(5),
        initial_commit_chunks: 1,
        flags: TableFlags::IDENTITY,
        layout: vmem::MemoryLayout::new(),
    })
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_after_every_operation(ops in ops()) {
        let mut table = new_table();
        let mut live: Vec<Handle> = Vec::new();
        let mut dead: Vec<Handle> = Vec::new();

        for op in ops {
            match op {
                Op::Create(n) => {
                    let mut ids = vec![Handle::NONE; n];
                    table.create_ids(&mut ids).unwrap();
                    // no duplicates among live handles
                    let unique: HashSet<u32> = live
                        .iter()
                        .chain(ids.iter())
                        .map(|h| h.bits())
                        .collect();
                    prop_assert_eq!(unique.len(), live.len() + ids.len());
                    live.extend(ids);
                }
                Op::DeleteLive(seed) => {
                    if live.is_empty() {
                        continue;
                    }
                    let victim = live.swap_remove(seed % live.len());
                    table.delete_ids(core::slice::from_ref(&victim));
                    prop_assert!(!table.validate(victim));
                    dead.push(victim);
                }
                Op::DeleteStale(seed) => {
                    if dead.is_empty() {
                        continue;
                    }
                    let stale = dead[seed % dead.len()];
                    let counts_before: Vec<u32> = (0..table.commit_count())
                        .map(|c| table.chunk_item_count(c))
                        .collect();
                    table.delete_ids(core::slice::from_ref(&stale));
                    let counts_after: Vec<u32> = (0..table.commit_count())
                        .map(|c| table.chunk_item_count(c))
                        .collect();
                    prop_assert_eq!(counts_before, counts_after);
                }
                Op::Reset => {
                    // reset rewinds generations, so pre-reset handles can
                    // collide bit-for-bit with post-reset allocations; the
                    // model forgets them rather than tracking false stales.
                    live.clear();
                    dead.clear();
                    table.reset();
                }
            }

            prop_assert!(table.verify());
            prop_assert_eq!(table.validate_ids(&live), live.len());
            // stale handles must never validate (H1) unless the slot wrapped
            // through the whole generation space back onto the same value.
            for &h in &dead {
                if !generation_reused(&live, h) {
                    prop_assert!(!table.validate(h));
                }
            }
        }
    }

    /// H2: delete + re-create in the same slot bumps the generation by
    /// exactly one, modulo the generation space.
    #[test]
    fn reallocation_bumps_generation(churn in 1usize..40) {
        let mut table = new_table();
        let mut id = [Handle::NONE];
        table.create_ids(&mut id).unwrap();

        let mut expected = id[0].generation();
        for _ in 0..churn {
            table.delete_ids(&id);
            table.create_ids(&mut id).unwrap();
            expected = (expected + 1) % MAX_GENERATIONS;
            prop_assert_eq!(id[0].generation(), expected);
            prop_assert!(table.verify());
        }
    }
}

/// After a reset, generations rewind; a stale pre-reset handle with
/// generation 0 can collide with a fresh allocation of the same slot.
fn generation_reused(live: &[Handle], stale: Handle) -> bool {
    live.iter().any(|l| {
        l.chunk_index() == stale.chunk_index()
            && l.slot_index() == stale.slot_index()
            && l.generation() == stale.generation()
    })
}
