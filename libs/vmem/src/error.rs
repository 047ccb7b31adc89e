// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemError {
    /// A size of zero, a non-power-of-two alignment, or an allocation that
    /// can never fit the reservation.
    InvalidArgument,
    /// The request would grow past the end of the reserved address range.
    OutOfReserve,
    /// The underlying `mmap`/`mprotect` call failed; the raw `errno` value is
    /// preserved for the caller.
    OsError(i32),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::InvalidArgument => f.write_str("invalid argument"),
            MemError::OutOfReserve => f.write_str("allocation exceeds the reserved address range"),
            MemError::OsError(errno) => write!(f, "virtual memory syscall failed (errno {errno})"),
        }
    }
}

impl core::error::Error for MemError {}

impl MemError {
    /// Capture the current `errno` as a [`MemError::OsError`].
    pub(crate) fn last_os_error() -> Self {
        MemError::OsError(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}
