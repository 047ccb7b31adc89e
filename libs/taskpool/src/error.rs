// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use vmem::MemError;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskError {
    /// Null/oversize inputs, a misconfigured pool set, relaunching a task,
    /// or exceeding a hard structural bound.
    InvalidArgument,
    /// The pool has no free task slot and the caller may not block.
    PoolFull,
    /// Committing pool memory failed.
    OutOfMemory,
    /// Observed after scheduler shutdown has begun.
    ShuttingDown,
    /// A handle failed round-trip validation where that is an error rather
    /// than a silent no-op.
    InvalidHandle,
    /// An OS call failed; the raw error code is preserved.
    OsError(i32),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::InvalidArgument => f.write_str("invalid argument"),
            TaskError::PoolFull => f.write_str("task pool is saturated"),
            TaskError::OutOfMemory => f.write_str("pool memory commit failed"),
            TaskError::ShuttingDown => f.write_str("scheduler is shutting down"),
            TaskError::InvalidHandle => f.write_str("stale or foreign task id"),
            TaskError::OsError(code) => write!(f, "os call failed (code {code})"),
        }
    }
}

impl core::error::Error for TaskError {}

impl From<MemError> for TaskError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::InvalidArgument => TaskError::InvalidArgument,
            MemError::OutOfReserve => TaskError::OutOfMemory,
            MemError::OsError(code) => TaskError::OsError(code),
        }
    }
}
