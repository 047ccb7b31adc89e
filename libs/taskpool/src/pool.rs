// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::TaskError;
use crate::id::{MAX_POOLS, MAX_TASK_GENERATIONS, PermitRef, TaskId};
use crate::park::{Parker, ParkingLot, StdPark};
use crate::permits::PermitsList;
use crate::ring::{FreeRing, ReadyDeque, Steal};
use crate::slot::{CompletionMode, MAX_DEPS_PER_TASK, MAX_TASK_ARGS_BYTES, TaskArgs, TaskInit, TaskSlot};
use crate::state::{Phase, StateTag};
use crate::tid;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use util::{Backoff, CachePadded, align_up};
use vmem::{KIB, VirtualRegion, page_size};

/// Hard upper bound on simultaneously active tasks per pool (the slot index
/// field of a task id is 16 bits wide).
pub const MAX_ACTIVE_TASKS_LIMIT: u32 = 65536;

const MIN_ACTIVE_TASKS: u32 = 16;
const USER_DATA_BYTES: usize = 4 * KIB;
/// Fresh slots/permits are committed and initialized this many at a time.
const COMMIT_BATCH: u32 = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// The owning thread may publish steal notifications.
        const ALLOW_PUBLISH = 1 << 0;
        /// Other threads may steal from this pool's ready deque.
        const ALLOW_STEAL = 1 << 1;
        /// `define` may block when the pool is saturated.
        const OWNER_MAY_BLOCK = 1 << 2;
        /// The pool is bound to a scheduler-owned worker thread.
        const WORKER = 1 << 3;
    }
}

/// Application-visible pool type tag. The built-in values cover the
/// scheduler's own threads; applications add their own above
/// [`PoolTypeId::FIRST_USER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTypeId(pub u32);

impl PoolTypeId {
    pub const MAIN: Self = Self(0);
    pub const CPU_WORKER: Self = Self(1);
    pub const AIO_WORKER: Self = Self(2);
    pub const FIRST_USER: Self = Self(16);
}

/// Configuration for one pool type.
#[derive(Debug, Clone, Copy)]
pub struct TaskPoolConfig {
    pub type_id: PoolTypeId,
    /// Number of pools of this type.
    pub count: u32,
    /// Maximum simultaneously active tasks per pool; rounded up to a power
    /// of two, at most [`MAX_ACTIVE_TASKS_LIMIT`].
    pub max_active_tasks: u32,
    pub flags: PoolFlags,
}

/// Configuration for [`PoolStorage::create`].
#[derive(Debug, Clone)]
pub struct StorageInit<'a> {
    pub configs: &'a [TaskPoolConfig],
}

/// Check a set of pool configurations, writing a per-config verdict into
/// `results`.
///
/// # Errors
///
/// Returns the first global error (empty set, mismatched `results` length,
/// duplicate type ids, more pools than a task id can address) or
/// `InvalidArgument` when any single config failed.
pub fn validate_configs(
    configs: &[TaskPoolConfig],
    results: &mut [Option<TaskError>],
) -> Result<(), TaskError> {
    if configs.is_empty() || results.len() != configs.len() {
        return Err(TaskError::InvalidArgument);
    }

    let mut total_pools: u64 = 0;
    let mut failed = false;
    for (i, config) in configs.iter().enumerate() {
        let mut verdict = None;
        if config.count == 0 {
            verdict = Some(TaskError::InvalidArgument);
        }
        if config.max_active_tasks == 0 || config.max_active_tasks > MAX_ACTIVE_TASKS_LIMIT {
            verdict = Some(TaskError::InvalidArgument);
        }
        if configs[..i].iter().any(|c| c.type_id == config.type_id) {
            verdict = Some(TaskError::InvalidArgument);
        }
        total_pools += u64::from(config.count);
        failed |= verdict.is_some();
        results[i] = verdict;
    }
    if total_pools > MAX_POOLS as u64 {
        return Err(TaskError::InvalidArgument);
    }
    if failed {
        return Err(TaskError::InvalidArgument);
    }
    Ok(())
}

/// Bytes of address space one storage with these configs will reserve.
#[must_use]
pub fn query_storage_size(configs: &[TaskPoolConfig]) -> usize {
    configs
        .iter()
        .map(|c| PoolLayout::new(c.max_active_tasks).total * c.count as usize)
        .sum()
}

/// Offsets of the fixed per-pool memory map inside one reservation:
/// user data, the three rings, then the on-demand slot and permit arenas.
#[derive(Debug, Clone, Copy)]
struct PoolLayout {
    capacity: u32,
    permit_ring: usize,
    slot_ring: usize,
    ready_ring: usize,
    slots: usize,
    permits: usize,
    /// Committed eagerly: user data + rings.
    header: usize,
    total: usize,
}

impl PoolLayout {
    fn new(max_active: u32) -> Self {
        let capacity = max_active
            .next_power_of_two()
            .clamp(MIN_ACTIVE_TASKS, MAX_ACTIVE_TASKS_LIMIT);
        let cap = capacity as usize;
        let ring_bytes = cap * size_of::<u32>();
        // the ready deque also receives ids owned by *other* pools (a
        // completer always publishes onto its own deque), so it is always
        // sized for the per-pool task limit, not this pool's capacity.
        let ready_bytes = MAX_ACTIVE_TASKS_LIMIT as usize * size_of::<u32>();

        let permit_ring = USER_DATA_BYTES;
        let slot_ring = permit_ring + ring_bytes;
        let ready_ring = slot_ring + ring_bytes;
        let header = align_up(ready_ring + ready_bytes, page_size());
        let slots = header;
        let permits = slots + cap * size_of::<TaskSlot>();
        let total = align_up(permits + cap * size_of::<PermitsList>(), page_size());

        Self {
            capacity,
            permit_ring,
            slot_ring,
            ready_ring,
            slots,
            permits,
            header,
            total,
        }
    }
}

/// One per-thread task pool: a slab of task slots and permit lists in a
/// reserve/commit region, the free rings recycling them, and the ready
/// deque.
pub(crate) struct TaskPool {
    region: VirtualRegion,
    index: u32,
    type_id: PoolTypeId,
    flags: PoolFlags,
    layout: PoolLayout,
    pub(crate) ready: ReadyDeque,
    slot_free: FreeRing,
    permit_free: FreeRing,
    /// Thread currently bound to the pool; `tid::UNBOUND` when free.
    bound_thread: AtomicU64,
    seed: AtomicU64,
    /// Pool index + 1 of the peer that woke this pool's worker.
    pub(crate) wakeup_hint: AtomicU32,
    /// Initialized-slot watermark. Written by the owner, read by anyone
    /// resolving an id.
    slot_committed: CachePadded<AtomicU32>,
    permit_committed: CachePadded<AtomicU32>,
}

// === impl TaskPool ===

impl TaskPool {
    fn create(index: u32, config: &TaskPoolConfig) -> Result<Self, TaskError> {
        let layout = PoolLayout::new(config.max_active_tasks);
        let region = VirtualRegion::reserve(layout.total)?;
        region.commit(0, layout.header)?;

        let cap = layout.capacity as usize;
        // Safety: the header prefix is committed and zeroed; each ring gets
        // a disjoint, 4-aligned block that lives as long as the region.
        let (permit_free, slot_free, ready) = unsafe {
            (
                FreeRing::from_raw(region.as_ptr(layout.permit_ring), cap),
                FreeRing::from_raw(region.as_ptr(layout.slot_ring), cap),
                ReadyDeque::from_raw(
                    region.as_ptr(layout.ready_ring),
                    MAX_ACTIVE_TASKS_LIMIT as usize,
                ),
            )
        };

        Ok(Self {
            region,
            index,
            type_id: config.type_id,
            flags: config.flags,
            layout,
            ready,
            slot_free,
            permit_free,
            bound_thread: AtomicU64::new(tid::UNBOUND),
            seed: AtomicU64::new(0),
            wakeup_hint: AtomicU32::new(0),
            slot_committed: CachePadded::new(AtomicU32::new(0)),
            permit_committed: CachePadded::new(AtomicU32::new(0)),
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    #[inline]
    pub(crate) fn type_id(&self) -> PoolTypeId {
        self.type_id
    }

    #[inline]
    pub(crate) fn bound_thread(&self) -> u64 {
        self.bound_thread.load(Ordering::Acquire)
    }

    fn slots_ptr(&self) -> *mut TaskSlot {
        self.region.as_ptr(self.layout.slots).cast::<TaskSlot>()
    }

    fn permits_ptr(&self) -> *mut PermitsList {
        self.region.as_ptr(self.layout.permits).cast::<PermitsList>()
    }

    /// The slot named by `slot_index`, which must be below the committed
    /// watermark.
    pub(crate) fn slot(&self, slot_index: u32) -> &TaskSlot {
        debug_assert!(slot_index < self.slot_committed.load(Ordering::Acquire));
        // Safety: the slot was initialized before the watermark moved past
        // it, and slot ids only reach other threads after that.
        unsafe { &*self.slots_ptr().add(slot_index as usize) }
    }

    pub(crate) fn permit(&self, permit_index: u32) -> &PermitsList {
        debug_assert!(permit_index < self.permit_committed.load(Ordering::Acquire));
        // Safety: as for `slot`.
        unsafe { &*self.permits_ptr().add(permit_index as usize) }
    }

    /// True when `slot_index` names committed slot memory.
    fn slot_in_range(&self, slot_index: u32) -> bool {
        slot_index < self.slot_committed.load(Ordering::Acquire)
    }

    /// Allocate a task slot index. Owner thread only.
    ///
    /// Recycled slots are preferred; fresh slots are committed in batches
    /// until the capacity is reached, after which the call blocks on the
    /// free ring (when `may_block`) or fails with `PoolFull`.
    fn alloc_slot(&self, may_block: bool, shutdown: &AtomicBool) -> Result<u32, TaskError> {
        if let Some(index) = self.slot_free.pop() {
            return Ok(index);
        }

        let committed = self.slot_committed.load(Ordering::Relaxed);
        if committed < self.layout.capacity {
            let batch = COMMIT_BATCH.min(self.layout.capacity - committed);
            let offset = self.layout.slots + committed as usize * size_of::<TaskSlot>();
            self.region
                .commit(offset, batch as usize * size_of::<TaskSlot>())?;
            // Safety: freshly committed, exclusively owned until the
            // watermark store below publishes the initialized slots.
            unsafe {
                let base = self.slots_ptr().add(committed as usize);
                for i in 0..batch as usize {
                    base.add(i).write(TaskSlot::new_dead());
                }
            }
            self.slot_committed
                .store(committed + batch, Ordering::Release);
            for extra in committed + 1..committed + batch {
                self.slot_free.push(extra);
            }
            tracing::trace!(pool = self.index, committed = committed + batch, "slot batch committed");
            return Ok(committed);
        }

        if !may_block {
            return Err(TaskError::PoolFull);
        }
        let mut backoff = Backoff::new();
        loop {
            if let Some(index) = self.slot_free.pop() {
                return Ok(index);
            }
            if shutdown.load(Ordering::Acquire) {
                return Err(TaskError::PoolFull);
            }
            backoff.spin();
        }
    }

    /// Allocate a permits-list index. Owner thread only. Same discipline as
    /// [`TaskPool::alloc_slot`].
    fn alloc_permit(&self, may_block: bool, shutdown: &AtomicBool) -> Result<u32, TaskError> {
        if let Some(index) = self.permit_free.pop() {
            return Ok(index);
        }

        let committed = self.permit_committed.load(Ordering::Relaxed);
        if committed < self.layout.capacity {
            let batch = COMMIT_BATCH.min(self.layout.capacity - committed);
            let offset = self.layout.permits + committed as usize * size_of::<PermitsList>();
            self.region
                .commit(offset, batch as usize * size_of::<PermitsList>())?;
            // Safety: as in alloc_slot.
            unsafe {
                let base = self.permits_ptr().add(committed as usize);
                for i in 0..batch as usize {
                    base.add(i).write(PermitsList::new_empty());
                }
            }
            self.permit_committed
                .store(committed + batch, Ordering::Release);
            for extra in committed + 1..committed + batch {
                self.permit_free.push(extra);
            }
            return Ok(committed);
        }

        if !may_block {
            return Err(TaskError::OutOfMemory);
        }
        let mut backoff = Backoff::new();
        loop {
            if let Some(index) = self.permit_free.pop() {
                return Ok(index);
            }
            if shutdown.load(Ordering::Acquire) {
                return Err(TaskError::OutOfMemory);
            }
            backoff.spin();
        }
    }
}

struct TypeFreeList {
    type_id: PoolTypeId,
    free: Vec<u32>,
    total: u32,
}

/// State shared by every pool, worker and handle of one storage.
pub(crate) struct Shared {
    pools: Box<[TaskPool]>,
    /// Per-type pool free lists; the lock is taken exclusively and is not on
    /// any fast path (only acquire/release of whole pools).
    free_lists: RwLock<Vec<TypeFreeList>>,
    pub(crate) parking: ParkingLot<StdPark>,
    pub(crate) shutdown: AtomicBool,
}

// === impl Shared ===

impl Shared {
    #[inline]
    pub(crate) fn pool(&self, index: u32) -> &TaskPool {
        &self.pools[index as usize]
    }

    #[inline]
    pub(crate) fn pool_count(&self) -> u32 {
        self.pools.len() as u32
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let woken = self.parking.unpark_all();
        tracing::debug!(woken, "scheduler shutdown signalled");
    }

    /// True when any pool's deque currently has observable work.
    pub(crate) fn any_ready_work(&self) -> bool {
        self.pools.iter().any(|p| p.ready.has_work())
    }

    /// Publish "pool `publisher` has work" and wake one parked worker.
    pub(crate) fn notify_steal(&self, publisher: u32) {
        self.parking.record_publisher(publisher);
        if let Some((parked_pool, token)) = self.parking.pop() {
            self.pool(parked_pool)
                .wakeup_hint
                .store(publisher + 1, Ordering::Release);
            tracing::trace!(publisher, woken = parked_pool, "waking parked worker");
            token.unpark();
        }
    }

    /// The slot for `id`, when `id` addresses committed memory of a known
    /// pool. The caller still has to check the generation.
    pub(crate) fn resolve(&self, id: TaskId) -> Option<&TaskSlot> {
        if !id.is_valid() || id.pool_index() >= self.pool_count() {
            return None;
        }
        let pool = self.pool(id.pool_index());
        if !pool.slot_in_range(id.slot_index()) {
            return None;
        }
        Some(pool.slot(id.slot_index()))
    }

    /// Whether `id` has reached the end of its lifecycle (or never was
    /// alive to begin with).
    pub(crate) fn task_is_done(&self, id: TaskId) -> bool {
        let Some(slot) = self.resolve(id) else {
            return true;
        };
        let state = slot.load_state(Ordering::Acquire);
        state.generation() != id.generation() || state.phase() == Phase::Completed
    }
}

// Lifecycle internals. All of these take the index of the pool bound to the
// *calling* thread: ready ids always land on the caller's own deque (the
// deque's single producer), and work stealing redistributes from there.

fn push_ready(shared: &Shared, my_pool: u32, id: TaskId) {
    let pool = shared.pool(my_pool);
    debug_assert_eq!(pool.bound_thread(), tid::current());
    pool.ready.push(id.bits());
    tracing::trace!(task = id.bits(), pool = my_pool, "task ready");
    if pool.flags.contains(PoolFlags::ALLOW_PUBLISH) {
        shared.notify_steal(my_pool);
    }
}

/// Decrement `list`'s wait count by `amount`; on the 0 transition drain the
/// dependents onto the calling thread's deque and recycle the list.
/// Returns the number of tasks made ready.
fn release_permit(shared: &Shared, my_pool: u32, permit: PermitRef, amount: i32) -> usize {
    let list = shared.pool(permit.pool_index()).permit(permit.slot_index());
    let prev = list.wait_count.fetch_sub(amount, Ordering::AcqRel);
    debug_assert!(prev >= amount);
    if prev != amount {
        return 0;
    }

    // we drove the count to zero: this consume happens exactly once.
    let mut ready = 0;
    for cell in &list.task_list {
        let id = TaskId::from_bits(cell.load(Ordering::Acquire));
        if id.is_none() {
            break;
        }
        push_ready(shared, my_pool, id);
        ready += 1;
    }
    let owner = list.owner_pool.load(Ordering::Relaxed);
    shared.pool(owner).permit_free.push(permit.slot_index());
    tracing::trace!(permit = permit.bits(), ready, "permits list fired");
    ready
}

/// Decrement `id`'s work count once; on the final decrement finish the task.
/// Returns the number of tasks made ready.
fn decrement_work(shared: &Shared, my_pool: u32, id: TaskId) -> usize {
    let Some(slot) = shared.resolve(id) else {
        return 0;
    };
    let prev = slot.work_count.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev >= 1, "task {id:?} completed more often than defined");
    if prev != 1 {
        return 0;
    }
    finish_task(shared, my_pool, id)
}

/// The final work-count decrement happened: mark the task completed, fire
/// its permits, propagate to the parent and recycle the slot.
fn finish_task(shared: &Shared, my_pool: u32, id: TaskId) -> usize {
    let task_pool = shared.pool(id.pool_index());
    let slot = task_pool.slot(id.slot_index());

    // move to Completed, snapshotting the permit count; attachers racing
    // this transition either land before it (and are fired below) or
    // observe Completed and count themselves satisfied.
    let mut snapshot;
    loop {
        snapshot = slot.load_state(Ordering::Acquire);
        debug_assert_eq!(snapshot.generation(), id.generation());
        let next = snapshot.with(StateTag::PHASE, Phase::Completed);
        if slot
            .state
            .compare_exchange(snapshot.bits(), next.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }

    let mut ready = 0;
    for i in 0..snapshot.permit_count() as usize {
        // the attacher reserved entry i before our snapshot saw it; its
        // store follows immediately, so spin for it.
        let permit = loop {
            let bits = slot.permits[i].load(Ordering::Acquire);
            if bits != 0 {
                break PermitRef::from_bits(bits);
            }
            core::hint::spin_loop();
        };
        ready += release_permit(shared, my_pool, permit, 1);
    }

    // Safety: public data is immutable after define; the slot cannot be
    // recycled before the free-ring push below.
    let parent = unsafe { (*slot.public.get()).parent };

    // bump the generation so every outstanding id for this task is stale,
    // then hand the slot back to its owner pool.
    let next_gen = (id.generation() + 1) % MAX_TASK_GENERATIONS;
    slot.state
        .store(StateTag::dead(next_gen).bits(), Ordering::Release);
    task_pool.slot_free.push(id.slot_index());
    tracing::trace!(task = id.bits(), ready, "task finished");

    if !parent.is_none() {
        ready += decrement_work(shared, my_pool, parent);
    }
    ready
}

enum Attach {
    Attached,
    /// The dependency is already done (or stale): satisfied at attach time.
    Satisfied,
    /// The dependency's permit array is full.
    Overflow,
}

fn try_attach(shared: &Shared, dep: TaskId, permit: PermitRef) -> Attach {
    let Some(slot) = shared.resolve(dep) else {
        return Attach::Satisfied;
    };
    loop {
        let cur = slot.load_state(Ordering::Acquire);
        if cur.generation() != dep.generation() || cur.phase() == Phase::Completed {
            return Attach::Satisfied;
        }
        let n = cur.permit_count();
        if n as usize == crate::slot::MAX_PERMITS_PER_TASK {
            return Attach::Overflow;
        }
        let next = cur.with(StateTag::PERMIT_COUNT, n + 1);
        if slot
            .state
            .compare_exchange(cur.bits(), next.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // entry n is ours now; the finisher spins on NONE until this
            // store lands.
            slot.permits[n as usize].store(permit.bits(), Ordering::Release);
            return Attach::Attached;
        }
    }
}

/// Convert `deps` into a permits list gating `id`'s launch.
///
/// The list starts with `deps.len() + 1` holds; the `+1` is released by
/// `launch`, every already-done dependency is released immediately, and the
/// rest are released by the producers' completions.
fn attach_dependencies(
    shared: &Shared,
    my_pool: u32,
    id: TaskId,
    deps: &[TaskId],
) -> Result<PermitRef, TaskError> {
    let pool = shared.pool(my_pool);
    let may_block = pool.flags.contains(PoolFlags::OWNER_MAY_BLOCK);
    let permit_index = pool.alloc_permit(may_block, &shared.shutdown)?;
    let permit = PermitRef::pack(my_pool, permit_index);

    let list = pool.permit(permit_index);
    list.reinit(my_pool, deps.len() as i32 + 1, id);

    let mut attached: i32 = 0;
    for (i, &dep) in deps.iter().enumerate() {
        if dep.is_none() || dep == id {
            // a missing or self dependency is satisfied by definition
            continue;
        }
        match try_attach(shared, dep, permit) {
            Attach::Attached => attached += 1,
            Attach::Satisfied => {}
            Attach::Overflow => {
                // neutralize the list: clear its dependent so the already
                // attached producers fire into an empty list, and drop every
                // hold they will not release themselves. If nothing was
                // attached this frees the list on the spot.
                list.task_list[0].store(TaskId::NONE.bits(), Ordering::Release);
                let unreleased = deps.len() as i32 + 1 - attached;
                release_permit(shared, my_pool, permit, unreleased);
                tracing::debug!(
                    dep = deps[i].bits(),
                    "dependency permit array exhausted during define"
                );
                return Err(TaskError::InvalidArgument);
            }
        }
    }

    // everything not attached was satisfied at attach time
    let satisfied = deps.len() as i32 - attached;
    if satisfied > 0 {
        // cannot reach zero: the launch hold is still out.
        let prev = list.wait_count.fetch_sub(satisfied, Ordering::AcqRel);
        debug_assert!(prev > satisfied);
    }
    Ok(permit)
}

/// Raise `parent`'s work count for a child about to become visible.
fn raise_parent(shared: &Shared, parent: TaskId) -> Result<(), TaskError> {
    let Some(slot) = shared.resolve(parent) else {
        return Err(TaskError::InvalidArgument);
    };
    let state = slot.load_state(Ordering::Acquire);
    if state.generation() != parent.generation() || state.phase() == Phase::Completed {
        return Err(TaskError::InvalidArgument);
    }
    let prev = slot.work_count.fetch_add(1, Ordering::AcqRel);
    if prev < 1 {
        // the parent finished between the check and the increment; undo.
        slot.work_count.fetch_sub(1, Ordering::AcqRel);
        return Err(TaskError::InvalidArgument);
    }
    Ok(())
}

/// Run one task body on the calling thread.
pub(crate) fn run_task(
    shared: &Shared,
    my_pool: u32,
    id: TaskId,
    context: usize,
    thread_context: usize,
) {
    let Some(slot) = shared.resolve(id) else {
        debug_assert!(false, "ready deque produced an unresolvable id");
        return;
    };
    // Safety: public data and args are immutable between launch and the
    // final completion; the deque pop ordered their publication.
    let (main, args_ptr, scratch_ptr) = unsafe {
        let public = &*slot.public.get();
        (public.main, slot.args.get().cast::<u8>(), slot.async_scratch.get().cast::<u8>())
    };
    let Some(main) = main else { return };

    tracing::trace!(task = id.bits(), pool = my_pool, "running task body");
    let mut args = TaskArgs {
        task_id: id,
        pool: Pool { shared, index: my_pool },
        context,
        thread_context,
        args: args_ptr,
        scratch: scratch_ptr,
    };
    main(&mut args);
}

/// Steal one task id from a peer's deque, preferring the wakeup hint, then
/// sweeping all pools from a random starting point.
pub(crate) fn steal_once(shared: &Shared, my_pool: u32, rng: &mut fastrand::Rng) -> Option<TaskId> {
    const ROUNDS: usize = 4;

    let pool = shared.pool(my_pool);
    let hint = pool.wakeup_hint.swap(0, Ordering::Acquire);
    if hint != 0 && hint - 1 != my_pool {
        if let Steal::Stolen(bits) = shared.pool(hint - 1).ready.steal() {
            return Some(TaskId::from_bits(bits));
        }
    }

    let count = shared.pool_count();
    if count <= 1 {
        return None;
    }
    let mut backoff = Backoff::new();
    for _ in 0..ROUNDS {
        // start at a random peer so victims are spread; never start at (or
        // visit) our own pool.
        let start = rng.u32(0..count);
        for k in 0..count {
            let victim_index = (start + k) % count;
            if victim_index == my_pool {
                continue;
            }
            let victim = shared.pool(victim_index);
            if !victim.flags.contains(PoolFlags::ALLOW_STEAL) {
                continue;
            }
            match victim.ready.steal() {
                Steal::Stolen(bits) => {
                    tracing::trace!(victim = victim_index, thief = my_pool, "stole task");
                    return Some(TaskId::from_bits(bits));
                }
                // contended: move on to the next victim, retry next round
                Steal::Abort | Steal::Empty => {}
            }
        }
        backoff.spin();
    }
    None
}

/// A borrowed handle to one task pool. `Copy`, so bodies can freely pass it
/// along; all lifecycle operations live here.
#[derive(Clone, Copy)]
pub struct Pool<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) index: u32,
}

// === impl Pool ===

impl<'a> Pool<'a> {
    /// Define a new task in this pool.
    ///
    /// The calling thread must be the pool's bound thread. Blocks while the
    /// pool is saturated when the pool carries
    /// [`PoolFlags::OWNER_MAY_BLOCK`].
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after shutdown began, `PoolFull` when saturated and
    /// not allowed to block (or when shutdown interrupts the wait),
    /// `InvalidArgument` for oversized args, too many dependencies, a dead
    /// parent, or a dependency whose permit array is exhausted.
    pub fn define(&self, init: &TaskInit<'_>) -> Result<TaskId, TaskError> {
        let shared = self.shared;
        if shared.is_shutdown() {
            return Err(TaskError::ShuttingDown);
        }
        if init.args.len() > MAX_TASK_ARGS_BYTES || init.deps.len() > MAX_DEPS_PER_TASK {
            return Err(TaskError::InvalidArgument);
        }
        let pool = shared.pool(self.index);
        if pool.bound_thread() != tid::current() {
            return Err(TaskError::InvalidArgument);
        }

        let may_block = pool.flags.contains(PoolFlags::OWNER_MAY_BLOCK);
        let slot_index = pool.alloc_slot(may_block, &shared.shutdown)?;
        let slot = pool.slot(slot_index);
        let generation = slot.load_state(Ordering::Relaxed).generation();
        slot.reinit(init, generation);
        let id = TaskId::pack(self.index, slot_index, generation);

        if !init.parent.is_none() {
            if let Err(err) = raise_parent(shared, init.parent) {
                slot.state
                    .store(StateTag::dead(generation).bits(), Ordering::Release);
                pool.slot_free.push(slot_index);
                return Err(err);
            }
        }

        if !init.deps.is_empty() {
            match attach_dependencies(shared, self.index, id, init.deps) {
                Ok(permit) => slot.ready_gate.store(permit.bits(), Ordering::Release),
                Err(err) => {
                    if !init.parent.is_none() {
                        decrement_work(shared, self.index, init.parent);
                    }
                    slot.state
                        .store(StateTag::dead(generation).bits(), Ordering::Release);
                    pool.slot_free.push(slot_index);
                    return Err(err);
                }
            }
        }

        tracing::trace!(task = id.bits(), pool = self.index, "task defined");
        Ok(id)
    }

    /// Launch a previously defined task, allowing it to run and complete.
    /// Returns the number of tasks made ready (zero while dependencies
    /// remain).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `id` is stale or the task is not in the
    /// Defined phase (launching twice is an error).
    pub fn launch(&self, id: TaskId) -> Result<usize, TaskError> {
        let shared = self.shared;
        let Some(slot) = shared.resolve(id) else {
            return Err(TaskError::InvalidArgument);
        };

        loop {
            let cur = slot.load_state(Ordering::Acquire);
            if cur.generation() != id.generation() || cur.phase() != Phase::Defined {
                return Err(TaskError::InvalidArgument);
            }
            let next = cur.with(StateTag::PHASE, Phase::Launched);
            if slot
                .state
                .compare_exchange(cur.bits(), next.bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let gate = PermitRef::from_bits(slot.ready_gate.load(Ordering::Acquire));
        let ready = if gate.is_none() {
            push_ready(shared, self.index, id);
            1
        } else {
            // release the launch hold; fires when the dependencies are
            // already satisfied.
            release_permit(shared, self.index, gate, 1)
        };
        tracing::trace!(task = id.bits(), ready, "task launched");
        Ok(ready)
    }

    /// Record one completion of `id`. Fires permits and notifies the parent
    /// on the final decrement; returns the number of tasks the call made
    /// ready. Completing a stale id is a silent no-op.
    pub fn complete(&self, id: TaskId) -> Result<usize, TaskError> {
        let shared = self.shared;
        let Some(slot) = shared.resolve(id) else {
            return Ok(0);
        };
        if slot.load_state(Ordering::Acquire).generation() != id.generation() {
            return Ok(0);
        }
        Ok(decrement_work(shared, self.index, id))
    }

    /// Run and steal tasks on the calling thread until `id` is done.
    ///
    /// Spins with backoff between polls; never parks, so the caller's
    /// thread stays productive. Returns early when shutdown is observed
    /// (check the task's state afterwards).
    ///
    /// Executing tasks requires publishing their ready successors, which
    /// only the pool's bound thread may do; a caller waiting through a pool
    /// it does not own degrades to polling.
    pub fn wait(&self, id: TaskId, context: usize) {
        let shared = self.shared;
        let pool = shared.pool(self.index);
        let is_owner = pool.bound_thread() == tid::current();
        let mut rng = fastrand::Rng::with_seed(pool.seed.load(Ordering::Relaxed) ^ tid::current());
        let mut backoff = Backoff::new();

        while !shared.task_is_done(id) {
            if shared.is_shutdown() {
                return;
            }
            if is_owner {
                if let Some(bits) = pool.ready.take() {
                    run_task(shared, self.index, TaskId::from_bits(bits), context, 0);
                    backoff.reset();
                    continue;
                }
                if let Some(stolen) = steal_once(shared, self.index, &mut rng) {
                    run_task(shared, self.index, stolen, context, 0);
                    backoff.reset();
                    continue;
                }
            }
            backoff.spin();
        }
    }

    /// Run the body of an externally-completed task inline on the calling
    /// thread, then [`wait`](Pool::wait) for its external completion.
    ///
    /// The task must still be in the Defined phase: this call performs the
    /// launch transition itself *without* enqueueing the task, so the body
    /// runs exactly once, here, instead of on whichever worker dequeues it
    /// first.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `id` is stale, already launched, or not an
    /// external-completion task.
    pub fn execute_external_and_wait(&self, id: TaskId, context: usize) -> Result<(), TaskError> {
        let shared = self.shared;
        let Some(slot) = shared.resolve(id) else {
            return Err(TaskError::InvalidArgument);
        };
        // Safety: public data is immutable after define.
        let mode = unsafe { (*slot.public.get()).mode };
        if mode != CompletionMode::External {
            return Err(TaskError::InvalidArgument);
        }
        loop {
            let cur = slot.load_state(Ordering::Acquire);
            if cur.generation() != id.generation() || cur.phase() != Phase::Defined {
                return Err(TaskError::InvalidArgument);
            }
            let next = cur.with(StateTag::PHASE, Phase::Launched);
            if slot
                .state
                .compare_exchange(cur.bits(), next.bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        run_task(shared, self.index, id, context, 0);
        self.wait(id, context);
        Ok(())
    }

    /// Whether `id` has completed (or is stale). The moral equivalent of a
    /// failed handle validation: a completed task's id never validates
    /// again.
    #[must_use]
    pub fn task_done(&self, id: TaskId) -> bool {
        self.shared.task_is_done(id)
    }

    /// Maximum number of uncompleted tasks that can be defined against this
    /// pool.
    #[must_use]
    pub fn max_active_tasks(&self) -> u32 {
        self.shared.pool(self.index).capacity()
    }

    /// Numeric id of the thread the pool is bound to (zero when unbound).
    #[must_use]
    pub fn bound_thread_id(&self) -> u64 {
        self.shared.pool(self.index).bound_thread()
    }

    #[must_use]
    pub fn pool_type(&self) -> PoolTypeId {
        self.shared.pool(self.index).type_id()
    }

    /// This pool's stable index within its storage.
    #[must_use]
    pub fn pool_index(&self) -> u32 {
        self.index
    }

    /// Total number of pools in the owning storage.
    #[must_use]
    pub fn pool_count(&self) -> u32 {
        self.shared.pool_count()
    }

    /// The pool-local scratch area.
    #[must_use]
    pub fn user_data(&self) -> (*mut u8, usize) {
        let pool = self.shared.pool(self.index);
        (pool.region.as_ptr(0), USER_DATA_BYTES)
    }

    /// Publish that this pool has tasks available to steal, waking one
    /// parked worker.
    pub fn notify_tasks_to_steal(&self) {
        self.shared.notify_steal(self.index);
    }

    /// Block until some pool publishes work to steal, returning that pool's
    /// index. The notification may be stale by the time this returns; the
    /// returned index may even be this pool's own, in which case the caller
    /// should simply call again.
    #[must_use]
    pub fn wait_to_steal_tasks(&self) -> u32 {
        let shared = self.shared;
        loop {
            if let Some(peer) = shared.parking.publisher_hint(self.index) {
                return peer;
            }
            if shared.is_shutdown() {
                return self.index;
            }
            let events = shared.parking.ready_events();
            let parker = Parker::new(StdPark::new());
            shared.parking.park(self.index, &parker, || {
                shared.parking.ready_events() != events || shared.is_shutdown()
            });
        }
    }
}

impl fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("index", &self.index)
            .field("type_id", &self.pool_type())
            .finish()
    }
}

/// A pool acquired from a [`PoolStorage`] and bound to the calling thread.
/// Released back to the storage's free list on drop.
pub struct OwnedPool {
    shared: Arc<Shared>,
    index: u32,
}

// === impl OwnedPool ===

impl OwnedPool {
    /// The borrowed handle used for all lifecycle operations.
    #[must_use]
    pub fn pool(&self) -> Pool<'_> {
        Pool {
            shared: &self.shared,
            index: self.index,
        }
    }
}

impl Drop for OwnedPool {
    fn drop(&mut self) {
        let pool = self.shared.pool(self.index);
        pool.bound_thread.store(tid::UNBOUND, Ordering::Release);
        let mut lists = self.shared.free_lists.write().unwrap();
        if let Some(list) = lists.iter_mut().find(|l| l.type_id == pool.type_id()) {
            list.free.push(self.index);
        }
        tracing::debug!(pool = self.index, "pool released");
    }
}

/// Owner of every task pool of one scheduler instance.
///
/// Dropping the storage signals shutdown; workers observing the signal
/// finish their current task and exit.
#[derive(Clone)]
pub struct PoolStorage {
    shared: Arc<Shared>,
}

// === impl PoolStorage ===

impl PoolStorage {
    /// Reserve and initialize every pool described by `init`.
    ///
    /// # Errors
    ///
    /// Propagates config validation failures and reservation errors.
    pub fn create(init: &StorageInit<'_>) -> Result<Self, TaskError> {
        let mut results = vec![None; init.configs.len()];
        validate_configs(init.configs, &mut results)?;

        let mut pools = Vec::new();
        let mut free_lists = Vec::new();
        for config in init.configs {
            let mut free = Vec::with_capacity(config.count as usize);
            for _ in 0..config.count {
                let index = pools.len() as u32;
                pools.push(TaskPool::create(index, config)?);
                free.push(index);
            }
            // pop from the back hands out the lowest index first
            free.reverse();
            free_lists.push(TypeFreeList {
                type_id: config.type_id,
                free,
                total: config.count,
            });
        }

        tracing::debug!(pools = pools.len(), "pool storage created");
        Ok(Self {
            shared: Arc::new(Shared {
                pools: pools.into_boxed_slice(),
                free_lists: RwLock::new(free_lists),
                parking: ParkingLot::new(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Acquire a pool of `type_id` and bind it to the calling thread.
    ///
    /// `seed` feeds the steal-victim PRNG; pass `None` to seed from the
    /// clock. Not for performance-critical paths.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unknown type, `PoolFull` when every pool of
    /// the type is in use, `ShuttingDown` after shutdown.
    pub fn acquire_pool(
        &self,
        type_id: PoolTypeId,
        seed: Option<&[u8]>,
    ) -> Result<OwnedPool, TaskError> {
        if self.shared.is_shutdown() {
            return Err(TaskError::ShuttingDown);
        }
        if let Some(seed) = seed {
            if seed.len() < crate::PRNG_SEED_SIZE {
                return Err(TaskError::InvalidArgument);
            }
        }

        let index = {
            let mut lists = self.shared.free_lists.write().unwrap();
            let list = lists
                .iter_mut()
                .find(|l| l.type_id == type_id)
                .ok_or(TaskError::InvalidArgument)?;
            list.free.pop().ok_or(TaskError::PoolFull)?
        };

        let pool = self.shared.pool(index);
        pool.bound_thread.store(tid::current(), Ordering::Release);
        pool.seed.store(fold_seed(seed), Ordering::Relaxed);
        pool.wakeup_hint.store(0, Ordering::Relaxed);
        tracing::debug!(pool = index, ?type_id, "pool acquired");

        Ok(OwnedPool {
            shared: Arc::clone(&self.shared),
            index,
        })
    }

    /// Total number of pools, across all types.
    #[must_use]
    pub fn pool_count(&self) -> u32 {
        self.shared.pool_count()
    }

    /// Total pools of one type.
    #[must_use]
    pub fn pool_count_of_type(&self, type_id: PoolTypeId) -> u32 {
        let lists = self.shared.free_lists.read().unwrap();
        lists
            .iter()
            .find(|l| l.type_id == type_id)
            .map_or(0, |l| l.total)
    }

    /// Begin cooperative shutdown: wakes every parked worker and makes
    /// further `define`/`acquire_pool` calls fail.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for PoolStorage {
    fn drop(&mut self) {
        // the last storage handle going away is a shutdown signal for any
        // worker still holding the shared state.
        if Arc::strong_count(&self.shared) == 1 {
            self.shared.begin_shutdown();
        }
    }
}

/// Fold caller seed bytes (or the clock) into one PRNG seed word.
fn fold_seed(seed: Option<&[u8]>) -> u64 {
    match seed {
        Some(bytes) => {
            let mut folded = 0xcbf2_9ce4_8422_2325u64;
            for chunk in bytes.chunks(8) {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                folded = (folded ^ u64::from_ne_bytes(word)).wrapping_mul(0x1000_0000_01b3);
            }
            folded
        }
        None => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.subsec_nanos() as u64 | (d.as_secs() << 32));
            nanos ^ (tid::current().rotate_left(32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    fn main_only_storage(max_active: u32, may_block: bool) -> PoolStorage {
        let mut flags = PoolFlags::ALLOW_PUBLISH | PoolFlags::ALLOW_STEAL;
        if may_block {
            flags |= PoolFlags::OWNER_MAY_BLOCK;
        }
        let configs = [TaskPoolConfig {
            type_id: PoolTypeId::MAIN,
            count: 1,
            max_active_tasks: max_active,
            flags,
        }];
        PoolStorage::create(&StorageInit { configs: &configs }).unwrap()
    }

    fn counter_arg(counter: &AtomicU32) -> [u8; 8] {
        (counter as *const AtomicU32 as usize).to_ne_bytes()
    }

    /// Body: bump the counter passed by address, then self-complete.
    fn bump_and_complete(args: &mut TaskArgs<'_>) {
        let addr = args.args::<usize>();
        // Safety: the test keeps the counter alive across the wait.
        let counter = unsafe { &*(addr as *const AtomicU32) };
        counter.fetch_add(1, Ordering::AcqRel);
        args.pool.complete(args.task_id).unwrap();
    }

    #[test]
    fn define_launch_wait_complete_roundtrip() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);

        let id = pool
            .define(&TaskInit::internal(bump_and_complete, &counter_arg(&counter), &[]))
            .unwrap();
        assert!(!pool.task_done(id));
        assert_eq!(pool.launch(id).unwrap(), 1);

        pool.wait(id, 0);
        assert!(pool.task_done(id));
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn relaunch_is_an_error() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);

        let id = pool
            .define(&TaskInit::internal(bump_and_complete, &counter_arg(&counter), &[]))
            .unwrap();
        pool.launch(id).unwrap();
        assert_eq!(pool.launch(id), Err(TaskError::InvalidArgument));
    }

    #[test]
    fn stale_complete_is_a_silent_noop() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);

        let id = pool
            .define(&TaskInit::internal(bump_and_complete, &counter_arg(&counter), &[]))
            .unwrap();
        pool.launch(id).unwrap();
        pool.wait(id, 0);

        // the slot was recycled; the old id must be rejected quietly
        assert_eq!(pool.complete(id), Ok(0));
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn saturated_pool_fails_fast_without_block_flag() {
        let storage = main_only_storage(16, false);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        let mut ids = Vec::new();
        for _ in 0..16 {
            ids.push(pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap());
        }
        assert_eq!(
            pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])),
            Err(TaskError::PoolFull)
        );

        // completing one task frees a slot again
        pool.launch(ids[0]).unwrap();
        pool.wait(ids[0], 0);
        pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap();
    }

    #[test]
    fn dependency_chain_runs_in_order() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        let a = pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap();
        let b = pool
            .define(&TaskInit::internal(bump_and_complete, &arg, &[a]))
            .unwrap();

        // b launches first: zero ready, its dependency gate still holds
        assert_eq!(pool.launch(b).unwrap(), 0);
        assert_eq!(pool.launch(a).unwrap(), 1);

        pool.wait(b, 0);
        assert!(pool.task_done(a));
        assert!(pool.task_done(b));
        assert_eq!(counter.load(Ordering::Acquire), 2);
    }

    #[test]
    fn completed_dependency_is_satisfied_at_attach() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        let a = pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap();
        pool.launch(a).unwrap();
        pool.wait(a, 0);

        // a's id is stale now; depending on it must not gate b
        let b = pool
            .define(&TaskInit::internal(bump_and_complete, &arg, &[a]))
            .unwrap();
        assert_eq!(pool.launch(b).unwrap(), 1);
        pool.wait(b, 0);
        assert_eq!(counter.load(Ordering::Acquire), 2);
    }

    #[test]
    fn self_dependency_is_ignored() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        // a self-dependency cannot be expressed directly (the id does not
        // exist yet), but a dependency list containing NONE entries takes
        // the same satisfied-at-attach path.
        let id = pool
            .define(&TaskInit::internal(
                bump_and_complete,
                &arg,
                &[TaskId::NONE, TaskId::NONE],
            ))
            .unwrap();
        assert_eq!(pool.launch(id).unwrap(), 1);
        pool.wait(id, 0);
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn parent_completes_only_after_child() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        let parent = pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap();
        let child = pool
            .define(&TaskInit::internal_child(parent, bump_and_complete, &arg, &[]))
            .unwrap();
        pool.launch(parent).unwrap();

        // parent's body runs and self-completes, but the child holds a work
        // count reference: the parent must not finish yet.
        while counter.load(Ordering::Acquire) < 1 {
            if let Some(bits) = storage.shared().pool(0).ready.take() {
                run_task(storage.shared(), 0, TaskId::from_bits(bits), 0, 0);
            }
        }
        assert!(!pool.task_done(parent));

        pool.launch(child).unwrap();
        pool.wait(parent, 0);
        assert!(pool.task_done(child));
        assert_eq!(counter.load(Ordering::Acquire), 2);
    }

    #[test]
    fn slot_reuse_bumps_task_generation() {
        let storage = main_only_storage(16, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);
        let arg = counter_arg(&counter);

        let mut last: Option<TaskId> = None;
        for round in 0..40u32 {
            let id = pool.define(&TaskInit::internal(bump_and_complete, &arg, &[])).unwrap();
            pool.launch(id).unwrap();
            pool.wait(id, 0);
            assert!(pool.task_done(id));
            if let Some(prev) = last {
                if prev.slot_index() == id.slot_index() {
                    assert_eq!(
                        id.generation(),
                        (prev.generation() + 1) % MAX_TASK_GENERATIONS,
                        "round {round}"
                    );
                }
            }
            last = Some(id);
        }
        assert_eq!(counter.load(Ordering::Acquire), 40);
    }

    #[test]
    fn acquire_release_cycles_through_the_free_list() {
        let storage = main_only_storage(64, true);

        let first = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        assert_eq!(
            storage.acquire_pool(PoolTypeId::MAIN, None).err(),
            Some(TaskError::PoolFull)
        );
        let index = first.pool().pool_index();
        drop(first);

        let again = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        assert_eq!(again.pool().pool_index(), index);
        assert_eq!(
            storage.acquire_pool(PoolTypeId::CPU_WORKER, None).err(),
            Some(TaskError::InvalidArgument)
        );
    }

    #[test]
    fn config_validation_flags_bad_entries() {
        let flags = PoolFlags::ALLOW_PUBLISH;
        let configs = [
            TaskPoolConfig {
                type_id: PoolTypeId::MAIN,
                count: 1,
                max_active_tasks: 1024,
                flags,
            },
            TaskPoolConfig {
                type_id: PoolTypeId::MAIN, // duplicate
                count: 0,                  // and empty
                max_active_tasks: MAX_ACTIVE_TASKS_LIMIT + 1,
                flags,
            },
        ];
        let mut results = [None, None];
        assert_eq!(
            validate_configs(&configs, &mut results),
            Err(TaskError::InvalidArgument)
        );
        assert_eq!(results[0], None);
        assert_eq!(results[1], Some(TaskError::InvalidArgument));

        assert_eq!(
            validate_configs(&[], &mut []),
            Err(TaskError::InvalidArgument)
        );
    }

    #[test]
    fn storage_size_scales_with_capacity() {
        let small = [TaskPoolConfig {
            type_id: PoolTypeId::MAIN,
            count: 1,
            max_active_tasks: 64,
            flags: PoolFlags::empty(),
        }];
        let big = [TaskPoolConfig {
            type_id: PoolTypeId::MAIN,
            count: 1,
            max_active_tasks: 65536,
            flags: PoolFlags::empty(),
        }];
        assert!(query_storage_size(&big) > query_storage_size(&small));
        // a maxed-out pool reserves north of 16 MiB of task slots alone
        assert!(query_storage_size(&big) > 16 * 1024 * 1024);
    }

    #[test]
    fn define_after_shutdown_is_rejected() {
        let storage = main_only_storage(64, true);
        let owned = storage.acquire_pool(PoolTypeId::MAIN, None).unwrap();
        let pool = owned.pool();
        let counter = AtomicU32::new(0);

        storage.shutdown();
        assert_eq!(
            pool.define(&TaskInit::internal(bump_and_complete, &counter_arg(&counter), &[])),
            Err(TaskError::ShuttingDown)
        );
    }
}
