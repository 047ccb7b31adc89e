// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A work-stealing task scheduler over per-thread task pools.
//!
//! Each OS thread binds a [`TaskPool`](pool::Pool) from a shared
//! [`PoolStorage`]. Tasks are 256-byte slots in the pool's reserve/commit
//! memory, named by packed generational [`TaskId`]s. Dependencies become
//! *permits lists* shared between producers; when the last producer of a
//! list completes, its dependents are pushed onto the completing thread's
//! ready deque and parked workers are woken. Worker threads pop their own
//! deque first and steal from peers when it runs dry.
//!
//! Completion is counted, not observed: every task starts with a work count
//! of one, each child adds one, and the task finishes on the final
//! decrement, firing its permits and notifying its parent.

mod error;
mod id;
pub mod loom;
mod park;
mod permits;
mod pool;
mod ring;
mod slot;
mod state;
mod tid;
mod worker;

pub use error::TaskError;
pub use id::TaskId;
pub use pool::{
    MAX_ACTIVE_TASKS_LIMIT, OwnedPool, Pool, PoolFlags, PoolStorage, PoolTypeId, StorageInit,
    TaskPoolConfig, query_storage_size, validate_configs,
};
pub use slot::{
    CompletionMode, IoResult, MAX_DEPS_PER_TASK, MAX_TASK_ARGS_BYTES, TaskArgs, TaskInit, TaskMain,
};
pub use worker::{WorkerInit, WorkerPool, WorkerPoolInit, query_worker_pool_size};

/// Seed bytes consumed by the steal-victim PRNG (sixteen 32-bit words).
pub const PRNG_SEED_SIZE: usize = 16 * size_of::<u32>();

/// Default stack size for worker threads.
pub const WORKER_STACK_SIZE_DEFAULT: usize = 64 * 1024;
