// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::id::{PermitRef, TaskId};
use crate::pool::Pool;
use crate::state::StateTag;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use static_assertions::{assert_eq_size, const_assert_eq};

/// Maximum bytes of inline argument data per task.
pub const MAX_TASK_ARGS_BYTES: usize = 64;

/// Maximum dependencies a single task may be defined with.
pub const MAX_DEPS_PER_TASK: usize = 1024;

/// Maximum permits lists a single task can be a producer for: the slot
/// reserves exactly this many inline references.
pub(crate) const MAX_PERMITS_PER_TASK: usize = 15;

/// Per-slot scratch for in-flight async operations; holds at least an
/// [`IoResult`] for the lifetime of the request, which is guaranteed because
/// it lives in the task slot itself.
pub(crate) const ASYNC_SCRATCH_BYTES: usize = 48;

/// The entry point of a task body.
pub type TaskMain = fn(&mut TaskArgs<'_>);

/// How a task's final completion is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionMode {
    /// The task body calls `complete` exactly once before returning.
    Internal = 0,
    /// Some other action (typically an I/O completion) calls `complete`;
    /// the body may return without completing.
    External = 1,
}

/// Outcome of an async operation, delivered to the completion callback
/// through the task's scratch area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    pub ok: bool,
    /// Native OS error code when `ok` is false.
    pub error_code: i32,
    /// Bytes transferred (or an operation-defined amount).
    pub transferred: u64,
}

/// The caller-supplied portion of a task slot, written once during `define`
/// while the creator has exclusive ownership.
#[repr(C)]
pub(crate) struct PublicData {
    pub(crate) main: Option<TaskMain>,
    pub(crate) completion_cb: Option<TaskMain>,
    pub(crate) parent: TaskId,
    pub(crate) mode: CompletionMode,
}

/// One 256-byte, cache-line aligned task slot.
///
/// Ownership moves through the slot's lifetime: the creator owns
/// `public`/`args` between `define` and `launch`, the scheduler owns them
/// from `launch` until the final work-count decrement, and the pool's free
/// ring owns the slot afterwards. The atomics at the tail are the only
/// fields ever touched concurrently.
#[repr(C, align(64))]
pub(crate) struct TaskSlot {
    pub(crate) public: UnsafeCell<PublicData>,
    pub(crate) args: UnsafeCell<[u8; MAX_TASK_ARGS_BYTES]>,
    pub(crate) async_scratch: UnsafeCell<[u8; ASYNC_SCRATCH_BYTES]>,
    /// Packed [`StateTag`].
    pub(crate) state: AtomicU32,
    /// Starts at 1, +1 per child, −1 per completion event.
    pub(crate) work_count: AtomicI32,
    /// [`PermitRef`] of the list gating this task's own launch; `NONE` when
    /// the task had no dependencies.
    pub(crate) ready_gate: AtomicU32,
    /// [`PermitRef`]s of the lists this task produces into. Entries below
    /// the state tag's permit count are meaningful; a reserved-but-unwritten
    /// entry reads as `NONE` until its writer stores it.
    pub(crate) permits: [AtomicU32; MAX_PERMITS_PER_TASK],
}

assert_eq_size!(TaskSlot, [u8; 256]);
const_assert_eq!(align_of::<TaskSlot>(), 64);
assert_eq_size!(PublicData, [u8; 24]);

// Safety: concurrent access is confined to the atomic fields; the
// UnsafeCell fields follow the ownership hand-off described on the type,
// with the ready-deque and free-ring release/acquire pairs ordering the
// transfers.
unsafe impl Send for TaskSlot {}
// Safety: see above.
unsafe impl Sync for TaskSlot {}

// === impl TaskSlot ===

impl TaskSlot {
    /// Value for freshly committed slot memory: dead at generation zero.
    pub(crate) fn new_dead() -> Self {
        Self {
            public: UnsafeCell::new(PublicData {
                main: None,
                completion_cb: None,
                parent: TaskId::NONE,
                mode: CompletionMode::Internal,
            }),
            args: UnsafeCell::new([0; MAX_TASK_ARGS_BYTES]),
            async_scratch: UnsafeCell::new([0; ASYNC_SCRATCH_BYTES]),
            state: AtomicU32::new(StateTag::dead(0).bits()),
            work_count: AtomicI32::new(0),
            ready_gate: AtomicU32::new(PermitRef::NONE.bits()),
            permits: [const { AtomicU32::new(0) }; MAX_PERMITS_PER_TASK],
        }
    }

    #[inline]
    pub(crate) fn load_state(&self, order: Ordering) -> StateTag {
        StateTag::from_bits(self.state.load(order))
    }

    /// Reinitialize a slot popped from the free ring for a new tenant.
    ///
    /// Must only be called by the pool owner while the slot is off every
    /// shared structure.
    pub(crate) fn reinit(&self, init: &TaskInit<'_>, generation: u32) {
        // Safety: the slot came off the free ring, so the creator has
        // exclusive ownership until launch.
        unsafe {
            *self.public.get() = PublicData {
                main: Some(init.main),
                completion_cb: init.completion_cb,
                parent: init.parent,
                mode: init.mode,
            };
            let args = &mut *self.args.get();
            args[..init.args.len()].copy_from_slice(init.args);
        }
        for permit in &self.permits {
            permit.store(PermitRef::NONE.bits(), Ordering::Relaxed);
        }
        self.ready_gate
            .store(PermitRef::NONE.bits(), Ordering::Relaxed);
        self.work_count.store(1, Ordering::Relaxed);
        self.state
            .store(StateTag::defined(generation).bits(), Ordering::Release);
    }
}

/// Description of a task to create, passed to `define`.
#[derive(Clone, Copy)]
pub struct TaskInit<'a> {
    pub(crate) main: TaskMain,
    pub(crate) completion_cb: Option<TaskMain>,
    pub(crate) parent: TaskId,
    pub(crate) mode: CompletionMode,
    pub(crate) args: &'a [u8],
    pub(crate) deps: &'a [TaskId],
}

// === impl TaskInit ===

impl<'a> TaskInit<'a> {
    /// An internally-completed root task: the body completes itself.
    #[must_use]
    pub fn internal(main: TaskMain, args: &'a [u8], deps: &'a [TaskId]) -> Self {
        Self {
            main,
            completion_cb: None,
            parent: TaskId::NONE,
            mode: CompletionMode::Internal,
            args,
            deps,
        }
    }

    /// An internally-completed child task of `parent`.
    #[must_use]
    pub fn internal_child(
        parent: TaskId,
        main: TaskMain,
        args: &'a [u8],
        deps: &'a [TaskId],
    ) -> Self {
        Self {
            parent,
            ..Self::internal(main, args, deps)
        }
    }

    /// An externally-completed root task: something other than the body
    /// (usually an I/O completion) calls `complete`.
    #[must_use]
    pub fn external(main: TaskMain, args: &'a [u8]) -> Self {
        Self {
            main,
            completion_cb: None,
            parent: TaskId::NONE,
            mode: CompletionMode::External,
            args,
            deps: &[],
        }
    }

    /// An externally-completed child task of `parent`.
    #[must_use]
    pub fn external_child(parent: TaskId, main: TaskMain, args: &'a [u8]) -> Self {
        Self {
            parent,
            ..Self::external(main, args)
        }
    }

    /// Install a callback to run on the I/O worker when a posted completion
    /// arrives for this task, before the task is completed externally.
    #[must_use]
    pub fn with_completion_callback(mut self, cb: TaskMain) -> Self {
        self.completion_cb = Some(cb);
        self
    }
}

/// Arguments passed to every task body (and completion callback): the id of
/// the running task, the executing thread's pool, and the worker pool's
/// context words. Bodies use the pool to define, launch and complete
/// further tasks.
pub struct TaskArgs<'a> {
    pub task_id: TaskId,
    pub pool: Pool<'a>,
    /// The worker pool's user context (zero when running outside workers).
    pub context: usize,
    /// Per-thread context produced by the worker-init callback.
    pub thread_context: usize,
    pub(crate) args: *const u8,
    pub(crate) scratch: *mut u8,
}

// === impl TaskArgs ===

impl TaskArgs<'_> {
    /// Copy the task's inline argument data out as a `T`.
    ///
    /// # Panics
    ///
    /// Panics when `T` is larger than [`MAX_TASK_ARGS_BYTES`].
    #[must_use]
    pub fn args<T: Copy>(&self) -> T {
        assert!(size_of::<T>() <= MAX_TASK_ARGS_BYTES);
        // Safety: the args buffer is MAX_TASK_ARGS_BYTES long and owned by
        // this task for the duration of the body.
        unsafe { self.args.cast::<T>().read_unaligned() }
    }

    /// The result of the async operation that completed this task. Only
    /// meaningful inside a completion callback.
    #[must_use]
    pub fn io_result(&self) -> IoResult {
        // Safety: the scratch area is ASYNC_SCRATCH_BYTES long and the I/O
        // worker wrote an IoResult before invoking the callback.
        unsafe { self.scratch.cast::<IoResult>().read_unaligned() }
    }

    pub(crate) fn set_io_result(&mut self, result: IoResult) {
        // Safety: scratch is ASYNC_SCRATCH_BYTES long, exclusively owned by
        // the I/O worker between dequeueing the completion and completing
        // the task.
        unsafe { self.scratch.cast::<IoResult>().write_unaligned(result) }
    }
}
