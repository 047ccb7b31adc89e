// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::id::TaskId;
use crate::park::{Parker, StdPark};
use crate::pool::{Pool, PoolStorage, PoolTypeId, run_task, steal_once};
use crate::slot::{IoResult, TaskArgs};
use crate::{TaskError, WORKER_STACK_SIZE_DEFAULT};
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Per-thread initialization callback: receives the worker's bound pool and
/// the worker pool's context, returns a per-thread context word handed to
/// every task body the thread runs.
pub type WorkerInit = fn(pool: Pool<'_>, pool_context: usize) -> Result<usize, i32>;

/// Configuration for [`WorkerPool::launch`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolInit {
    /// Threads running CPU-bound task bodies.
    pub cpu_workers: u32,
    /// Threads draining the async completion queue.
    pub io_workers: u32,
    /// Capacity of the completion queue.
    pub max_async_requests: u32,
    /// Opaque word passed to every task body as `context`.
    pub user_context: usize,
    pub worker_init: Option<WorkerInit>,
    pub stack_size: usize,
}

impl Default for WorkerPoolInit {
    fn default() -> Self {
        Self {
            cpu_workers: 1,
            io_workers: 0,
            max_async_requests: 256,
            user_context: 0,
            worker_init: None,
            stack_size: WORKER_STACK_SIZE_DEFAULT,
        }
    }
}

/// Bytes a worker pool with this configuration will pin: thread stacks plus
/// the completion queue.
#[must_use]
pub fn query_worker_pool_size(cpu_workers: u32, io_workers: u32, max_async_requests: u32) -> usize {
    (cpu_workers + io_workers) as usize * WORKER_STACK_SIZE_DEFAULT
        + max_async_requests as usize * size_of::<IoCompletion>()
}

struct IoCompletion {
    task: TaskId,
    result: IoResult,
}

/// The portable stand-in for an OS completion port: a bounded queue any
/// thread can post to and the I/O workers block on.
struct IoQueue {
    queue: Mutex<VecDeque<IoCompletion>>,
    cv: Condvar,
    capacity: usize,
}

// === impl IoQueue ===

impl IoQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            cv: Condvar::new(),
            capacity,
        }
    }

    fn post(&self, completion: IoCompletion) -> Result<(), TaskError> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(TaskError::PoolFull);
        }
        queue.push_back(completion);
        self.cv.notify_one();
        Ok(())
    }

    /// Block until a completion arrives or `shutdown` is observed.
    fn pop(&self, shutdown: &AtomicBool) -> Option<IoCompletion> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(completion) = queue.pop_front() {
                return Some(completion);
            }
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            queue = self.cv.wait(queue).unwrap();
        }
    }

    fn wake_all(&self) {
        let _guard = self.queue.lock().unwrap();
        self.cv.notify_all();
    }
}

/// A set of OS worker threads executing tasks from a [`PoolStorage`].
///
/// CPU workers run the steal loop; I/O workers drain the completion queue,
/// run completion callbacks and complete the initiating tasks externally.
pub struct WorkerPool {
    storage: PoolStorage,
    io: Arc<IoQueue>,
    user_context: usize,
    threads: Vec<JoinHandle<()>>,
}

// === impl WorkerPool ===

impl WorkerPool {
    /// Spawn and start every worker thread.
    ///
    /// Each thread acquires a pool of its built-in type
    /// ([`PoolTypeId::CPU_WORKER`] / [`PoolTypeId::AIO_WORKER`]) from
    /// `storage`, so the storage configs must provide enough pools of both
    /// types. If any thread fails to initialize, the whole worker pool is
    /// terminated and the first error is returned.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero-thread configuration, otherwise the
    /// first per-thread acquire/init failure.
    pub fn launch(storage: &PoolStorage, init: &WorkerPoolInit) -> Result<Self, TaskError> {
        if init.cpu_workers == 0 && init.io_workers == 0 {
            return Err(TaskError::InvalidArgument);
        }
        let stack_size = if init.stack_size == 0 {
            WORKER_STACK_SIZE_DEFAULT
        } else {
            init.stack_size
        };

        let io = Arc::new(IoQueue::new(init.max_async_requests as usize));
        let (tx, rx) = mpsc::channel::<Result<(), TaskError>>();
        let mut pool = Self {
            storage: storage.clone(),
            io: Arc::clone(&io),
            user_context: init.user_context,
            threads: Vec::with_capacity((init.cpu_workers + init.io_workers) as usize),
        };

        for i in 0..init.cpu_workers {
            let storage = storage.clone();
            let tx = tx.clone();
            let init = *init;
            let handle = std::thread::Builder::new()
                .name(format!("cpu-worker-{i}"))
                .stack_size(stack_size)
                .spawn(move || cpu_worker_main(&storage, &init, &tx))
                .map_err(|e| TaskError::OsError(e.raw_os_error().unwrap_or(0)))?;
            pool.threads.push(handle);
        }
        for i in 0..init.io_workers {
            let storage = storage.clone();
            let io = Arc::clone(&io);
            let tx = tx.clone();
            let init = *init;
            let handle = std::thread::Builder::new()
                .name(format!("io-worker-{i}"))
                .stack_size(stack_size)
                .spawn(move || io_worker_main(&storage, &io, &init, &tx))
                .map_err(|e| TaskError::OsError(e.raw_os_error().unwrap_or(0)))?;
            pool.threads.push(handle);
        }
        drop(tx);

        // every thread reports once after binding its pool and running the
        // init callback.
        for _ in 0..pool.threads.len() {
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    pool.shutdown_and_join();
                    return Err(err);
                }
                Err(_) => {
                    pool.shutdown_and_join();
                    return Err(TaskError::OsError(0));
                }
            }
        }

        tracing::debug!(
            cpu = init.cpu_workers,
            io = init.io_workers,
            "worker pool launched"
        );
        Ok(pool)
    }

    /// The application context word supplied at launch.
    #[must_use]
    pub fn user_context(&self) -> usize {
        self.user_context
    }

    /// Post an asynchronous completion for `task` from any thread (the
    /// analogue of posting to a completion port). An I/O worker will copy
    /// `result` into the task's scratch area, run the completion callback
    /// and complete the task externally.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after termination began, `PoolFull` when the
    /// completion queue is at capacity.
    pub fn post_completion(&self, task: TaskId, result: IoResult) -> Result<(), TaskError> {
        if self.storage.shared().is_shutdown() {
            return Err(TaskError::ShuttingDown);
        }
        self.io.post(IoCompletion { task, result })
    }

    /// Run tasks on the calling thread until `id` is done (see
    /// [`Pool::wait`]); the worker pool's user context is passed to every
    /// body executed this way.
    pub fn wait(&self, pool: Pool<'_>, id: TaskId) {
        pool.wait(id, self.user_context);
    }

    /// Run the body of an external-completion task inline, then wait for
    /// its completion (see [`Pool::execute_external_and_wait`]).
    ///
    /// # Errors
    ///
    /// See [`Pool::execute_external_and_wait`].
    pub fn execute_external_and_wait(&self, pool: Pool<'_>, id: TaskId) -> Result<(), TaskError> {
        pool.execute_external_and_wait(id, self.user_context)
    }

    /// Stop all workers and wait for them to exit. Tasks already running
    /// complete normally; pending ready tasks may or may not execute.
    pub fn terminate(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.storage.shutdown();
        self.io.wake_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("worker pool terminated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown_and_join();
        }
    }
}

/// Bind a pool, run the init callback, report startup, then return the
/// thread context.
fn worker_startup(
    storage: &PoolStorage,
    type_id: PoolTypeId,
    init: &WorkerPoolInit,
    tx: &mpsc::Sender<Result<(), TaskError>>,
) -> Option<(crate::pool::OwnedPool, usize)> {
    let owned = match storage.acquire_pool(type_id, None) {
        Ok(owned) => owned,
        Err(err) => {
            let _ = tx.send(Err(err));
            return None;
        }
    };
    let thread_context = match init.worker_init {
        Some(cb) => match cb(owned.pool(), init.user_context) {
            Ok(ctx) => ctx,
            Err(code) => {
                let _ = tx.send(Err(TaskError::OsError(code)));
                return None;
            }
        },
        None => 0,
    };
    let _ = tx.send(Ok(()));
    Some((owned, thread_context))
}

fn cpu_worker_main(
    storage: &PoolStorage,
    init: &WorkerPoolInit,
    tx: &mpsc::Sender<Result<(), TaskError>>,
) {
    let Some((owned, thread_context)) = worker_startup(storage, PoolTypeId::CPU_WORKER, init, tx)
    else {
        return;
    };
    let shared = storage.shared();
    let index = owned.pool().pool_index();
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();

    let parker = Parker::new(StdPark::new());
    let mut rng =
        fastrand::Rng::with_seed(shared.pool(index).bound_thread() ^ (u64::from(index) << 48));

    loop {
        if shared.is_shutdown() {
            tracing::debug!(worker = index, "stop signal received, shutting down");
            break;
        }
        if let Some(bits) = shared.pool(index).ready.take() {
            run_task(
                shared,
                index,
                TaskId::from_bits(bits),
                init.user_context,
                thread_context,
            );
            continue;
        }
        if let Some(stolen) = steal_once(shared, index, &mut rng) {
            run_task(shared, index, stolen, init.user_context, thread_context);
            continue;
        }
        // out of work: park, unless the registration re-check spots ready
        // work or shutdown.
        tracing::trace!(worker = index, "going to sleep");
        shared
            .parking
            .park(index, &parker, || shared.any_ready_work() || shared.is_shutdown());
        tracing::trace!(worker = index, "woke up");
    }
}

fn io_worker_main(
    storage: &PoolStorage,
    io: &IoQueue,
    init: &WorkerPoolInit,
    tx: &mpsc::Sender<Result<(), TaskError>>,
) {
    let Some((owned, thread_context)) = worker_startup(storage, PoolTypeId::AIO_WORKER, init, tx)
    else {
        return;
    };
    let shared = storage.shared();
    let index = owned.pool().pool_index();
    let _span = tracing::debug_span!("io worker main loop", worker = index).entered();

    while let Some(completion) = io.pop(&shared.shutdown) {
        let id = completion.task;
        let Some(slot) = shared.resolve(id) else {
            tracing::debug!(task = id.bits(), "dropping completion for stale task");
            continue;
        };
        if slot.load_state(Ordering::Acquire).generation() != id.generation() {
            tracing::debug!(task = id.bits(), "dropping completion for stale task");
            continue;
        }

        // Safety: public data is immutable after define; the task stays
        // alive until the external complete below.
        let (callback, args_ptr, scratch_ptr) = unsafe {
            let public = &*slot.public.get();
            (
                public.completion_cb,
                slot.args.get().cast::<u8>(),
                slot.async_scratch.get().cast::<u8>(),
            )
        };

        let mut args = TaskArgs {
            task_id: id,
            pool: owned.pool(),
            context: init.user_context,
            thread_context,
            args: args_ptr,
            scratch: scratch_ptr,
        };
        args.set_io_result(completion.result);
        if let Some(callback) = callback {
            tracing::trace!(task = id.bits(), "running completion callback");
            callback(&mut args);
        }
        // the external completion: the initiating task's body returned long
        // ago without completing.
        let _ = owned.pool().complete(id);
    }
    tracing::debug!(worker = index, "io worker shutting down");
}
